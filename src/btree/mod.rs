//! Generic B-tree support shared by the object map, file-system tree, and
//! snapshot metadata tree (`spec.md` §4.D, §4.G).
//!
//! Replaces the teacher's single flat `btree.rs`, which hard-coded one
//! descent path tied to the file-system catalog's key type. Splitting node
//! decode (`node`) from descent (`descent`) lets the same traversal engine
//! serve all three trees, differing only in their [`descent::ChildResolver`].

pub mod descent;
pub mod node;

pub use descent::{ChildResolver, Cursor, DirectResolver, OmapResolver, TreeAccess};
pub use node::{BTreeFooter, BTreeNode, BTreeNodeHeader, TocEntry};
