//! The rule tree.

use std::fmt::Write as _;

use serde_json::Value;

use super::{HeaderRule, IpRangeRule, split_range_entries};
use crate::Result;
use crate::config::{RawRule, RuleKind};
use crate::context::RequestContext;
use crate::interfaces::InterfaceSource;
use crate::template::render_str;

/// Inputs shared by every node of one tree build.
pub struct BuildContext<'a> {
    /// Template render context (`{"data": ...}` or empty)
    pub template_data: &'a Value,
    /// Local interface ranges for `addInterface`
    pub interfaces: &'a dyn InterfaceSource,
}

/// One node of an initialized rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
    /// Every child matches; short-circuits on the first miss
    AllOf(Vec<RuleNode>),
    /// Some child matches; short-circuits on the first hit
    AnyOf(Vec<RuleNode>),
    /// No child matches; short-circuits on the first hit
    NoneOf(Vec<RuleNode>),
    /// Client address range
    IpRange(IpRangeRule),
    /// Header patterns
    Header(HeaderRule),
}

impl RuleNode {
    /// Render, parse and compile one configured rule and its children.
    ///
    /// The first failure anywhere in the subtree aborts the build.
    pub fn build(raw: &RawRule, cx: &BuildContext<'_>) -> Result<Self> {
        Ok(match raw.kind {
            RuleKind::AllOf => Self::AllOf(Self::build_all(&raw.rules, cx)?),
            RuleKind::AnyOf => Self::AnyOf(Self::build_all(&raw.rules, cx)?),
            RuleKind::NoneOf => Self::NoneOf(Self::build_all(&raw.rules, cx)?),
            RuleKind::IpRange => {
                let mut ranges = Vec::new();
                for source in &raw.ranges {
                    let rendered = render_str(source, cx.template_data)?;
                    ranges.extend(split_range_entries(&rendered));
                }
                Self::IpRange(IpRangeRule::new(&ranges, raw.add_interface, cx.interfaces)?)
            }
            RuleKind::Header => {
                let patterns = raw
                    .headers
                    .iter()
                    .map(|(name, source)| {
                        let pattern = render_str(source, cx.template_data)?;
                        Ok((name.as_str(), pattern))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::Header(HeaderRule::new(patterns)?)
            }
        })
    }

    /// Build a list of sibling rules.
    pub fn build_all(raws: &[RawRule], cx: &BuildContext<'_>) -> Result<Vec<Self>> {
        raws.iter().map(|raw| Self::build(raw, cx)).collect()
    }

    /// Evaluate against a request. Matching leaves annotate `ctx`.
    pub fn matches(&self, ctx: &mut RequestContext) -> bool {
        match self {
            Self::AllOf(children) => children.iter().all(|c| c.matches(ctx)),
            Self::AnyOf(children) => matches_any(children, ctx),
            Self::NoneOf(children) => !matches_any(children, ctx),
            Self::IpRange(rule) => rule.matches(ctx),
            Self::Header(rule) => rule.matches(ctx),
        }
    }

    fn kind(&self) -> RuleKind {
        match self {
            Self::AllOf(_) => RuleKind::AllOf,
            Self::AnyOf(_) => RuleKind::AnyOf,
            Self::NoneOf(_) => RuleKind::NoneOf,
            Self::IpRange(_) => RuleKind::IpRange,
            Self::Header(_) => RuleKind::Header,
        }
    }

    /// Indented one-line-per-node outline, used by `tls-guard check`.
    #[must_use]
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.write_outline(&mut out, 0);
        out
    }

    fn write_outline(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        match self {
            Self::AllOf(children) | Self::AnyOf(children) | Self::NoneOf(children) => {
                let _ = writeln!(out, "{indent}{} ({} rules)", self.kind(), children.len());
                for child in children {
                    child.write_outline(out, depth + 1);
                }
            }
            Self::IpRange(rule) => {
                let cidrs: Vec<String> = rule.cidrs().iter().map(ToString::to_string).collect();
                let _ = writeln!(out, "{indent}ipRange [{}]", cidrs.join(", "));
            }
            Self::Header(rule) => {
                let _ = writeln!(out, "{indent}header ({} patterns)", rule.len());
            }
        }
    }
}

/// Implicit OR over sibling rules, in order.
pub fn matches_any(rules: &[RuleNode], ctx: &mut RequestContext) -> bool {
    rules.iter().any(|r| r.matches(ctx))
}
