use crate::stack::FiveTuple;

/// Sentinel for flows whose owning application could not be resolved.
pub const UID_UNKNOWN: i32 = -1;

/// Maps a 5-tuple to the uid of the application that originated it.
pub trait UidResolver {
    fn lookup(&mut self, tuple: &FiveTuple) -> Option<i32>;
}
