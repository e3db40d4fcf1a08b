mod error;
mod index;
mod node;
mod serialization;

pub use error::BTreeError;
pub use index::{BTreeIndex, BTreeIter};
pub use node::BTreeNode;
pub use serialization::{calculate_btree_order, deserialize_node, serialize_node};
