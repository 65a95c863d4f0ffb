pub mod bridge;
pub mod paper;
mod traits;

pub use bridge::{BridgeConfig, BridgeVenue};
pub use paper::{PaperConfig, PaperVenue};
pub use traits::{
    parse_venue_kind, CloseRequest, ExecutionVenue, FillKind, FillReport, OrderRequest, Position,
    PriceType, VenueAck, VenueKind,
};

use std::sync::Arc;

/// Build the configured venue. Paper venues are returned concretely as
/// well so the caller can drive their feed.
pub fn build_venue(
    kind: VenueKind,
    bridge: &BridgeConfig,
    paper: &PaperConfig,
) -> crate::error::Result<(Arc<dyn ExecutionVenue>, Option<Arc<PaperVenue>>)> {
    match kind {
        VenueKind::Paper => {
            let venue = Arc::new(PaperVenue::new(paper.clone()));
            Ok((venue.clone(), Some(venue)))
        }
        VenueKind::Bridge => Ok((Arc::new(BridgeVenue::new(bridge)?), None)),
    }
}
