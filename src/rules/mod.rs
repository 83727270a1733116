//! Access rules: matching primitives and the rule tree built from them.
//!
//! A [`RuleNode`] can only be obtained through [`RuleNode::build`], which
//! renders templates, parses CIDRs, compiles regexes and queries local
//! interfaces up front. A tree that exists is therefore fully initialized,
//! and matching never fails; it only answers yes or no.

mod cidr;
mod header;
mod ip_range;
mod tree;

pub use cidr::Cidr;
pub use header::HeaderRule;
pub use ip_range::{IpRangeRule, split_range_entries};
pub use tree::{BuildContext, RuleNode, matches_any};
