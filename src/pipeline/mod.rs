//! Message processing pipeline.
//!
//! Every inbound message, live or backfilled, passes through:
//! 1. `FilterEngine::evaluate()`: whitelist, ad and content filters
//! 2. `DistributionRouter::route()`: pick the destination
//! 3. `ContentTransformer::transform()`: copy mode only
//!
//! Delivery and checkpointing live in `dispatch`.

pub mod filter;
pub mod router;
pub mod transform;
pub mod types;
