pub mod item_packet;
pub mod run_meta;
pub mod source_packet;
pub mod sql_mirror;
pub mod taxonomy;

pub use item_packet::{ItemPacket, ItemPacketInput, build_item_packet};
pub use run_meta::{RunMetaPacket, build_run_meta_packet};
pub use source_packet::{SourceInput, SourcePacket, SourcePacketBuilder};

const HIGH_AMBIGUITY: f64 = 0.75;
const MEDIUM_AMBIGUITY: f64 = 0.35;

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub run_id: String,
    pub category: String,
    pub product_id: String,
    pub created_at: String,
}

pub fn ambiguity_level_for_score(score: f64) -> &'static str {
    if score >= HIGH_AMBIGUITY {
        "high"
    } else if score >= MEDIUM_AMBIGUITY {
        "medium"
    } else {
        "low"
    }
}
