/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed yet. Views raise
    /// snapshots from cache only once the state turns Offline.
    #[default]
    Unknown,
    Online,
    Offline,
}
