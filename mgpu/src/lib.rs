//! Thin RAII wrappers around the Vulkan objects backing the mania client's
//! renderer, built on [`ash`].
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! └── Device
//!     ├── Swapchain<T> (images → views → framebuffers)
//!     ├── RenderPass
//!     ├── ShaderModule → EntryPoint → PipelineState
//!     ├── MemBuffer
//!     ├── DescriptorPool
//!     ├── CommandPool
//!     ├── Fence / Semaphore
//!     └── FrameRenderer
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be destroyed
//! while children are alive. Construction is all-or-nothing: a failure
//! mid-way unwinds everything created so far in reverse order before the
//! error is reported.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod instance;
pub mod log;
pub mod mesh;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
