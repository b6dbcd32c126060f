use crate::mem::frame_table::SpaceId;

/// The view of the running process that trap handlers need.
pub trait Process {
    /// Name for diagnostics, typically the program's file name.
    fn name(&self) -> &str;

    /// The address space the process runs in.
    fn address_space(&self) -> SpaceId;

    /// Terminates the process with `status`. Its address space is torn down
    /// by whoever reaps it.
    fn exit(&self, status: i32);
}
