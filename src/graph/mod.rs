// The graph layer sits in front of the compiler. It holds a small tensor graph model, the
// tokenization passes that carve fusible clusters out of it, the M-dimension splitting
// heuristics shared with the runtime optimizer, and the lowering of a collapsed subgraph
// body into the linear IR the generator consumes.

//! Graph model, tokenization and subgraph lowering.

pub mod fc;
pub mod lower;
pub mod mha;
pub mod model;
pub mod split_dimension_m;
pub mod tokenization;

pub use fc::TokenizeFCSnippets;
pub use lower::lower_subgraph;
pub use mha::TokenizeMHASnippets;
pub use model::{AutoBroadcast, Model, Node, NodeId, NodeOp, Output, PartialShape, SnippetsNodeType, TensorDesc};
pub use split_dimension_m::SplitDimensionM;
pub use tokenization::{
    appropriate_for_subgraph, collapse, Cluster, Clusters, SnippetsTokenization, TokenizationConfig, TokenizationPass,
    TokenizeSnippets,
};
