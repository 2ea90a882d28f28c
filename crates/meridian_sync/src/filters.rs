//! Named predicates clients may subscribe with.

use meridian_core::{ComponentKind, EntityFilter};

use crate::error::{SyncError, SyncResult};

/// Names accepted by [`named_filter`].
pub const FILTER_NAMES: [&str; 4] = ["all", "players", "lights", "positioned"];

/// Resolves a client-supplied filter name. `None` means everything.
///
/// # Errors
///
/// [`SyncError::UnknownFilter`] for names outside [`FILTER_NAMES`].
pub fn named_filter(name: Option<&str>) -> SyncResult<EntityFilter> {
    let filter = match name.unwrap_or("all") {
        "all" => EntityFilter::everything(),
        "players" => EntityFilter::everything().with(ComponentKind::RemoteConnection),
        "lights" => EntityFilter::everything().with(ComponentKind::LightSource),
        "positioned" => EntityFilter::everything().with(ComponentKind::Position),
        other => return Err(SyncError::UnknownFilter(other.to_owned())),
    };
    Ok(filter)
}
