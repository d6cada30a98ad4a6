/// Maximum severity of validation-layer messages forwarded to `tracing`.
///
/// Passing a level to [`Instance::new`](crate::instance::Instance::new)
/// requests the debug-utils extension and the Khronos validation layer.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}
