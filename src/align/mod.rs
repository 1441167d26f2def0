//! Pairwise local alignment (`spec.md` §4.1).

mod sw;

pub use sw::{SwAlignment, SwAligner};
