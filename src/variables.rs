//! The variable tree returned by the debugger for one halted frame.
//!
//! Nodes are plain name/value pairs with nested children (structs, vectors,
//! SIMD lanes). The tree is a snapshot of one debug step: any stepping or
//! continue request invalidates it and callers must re-fetch.

use std::fmt;

/// A named value reported by the debugger, with nested children.
/// Child order is the protocol response order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableNode {
    pub name: String,
    pub value: String,
    pub children: Vec<VariableNode>,
}

impl VariableNode {
    pub fn find(&self, name: &str) -> Option<&VariableNode> {
        find(&self.children, name)
    }

    /// Parses the raw value as a scalar. Returns None when the text does not
    /// parse cleanly, so a type failure is distinguishable from a mismatch.
    pub fn parse<T: std::str::FromStr>(&self) -> Option<T> {
        self.value.trim().parse().ok()
    }
}

/// Finds the first variable with the given name in a sibling list.
pub fn find<'a>(vars: &'a [VariableNode], name: &str) -> Option<&'a VariableNode> {
    vars.iter().find(|v| v.name == name)
}

/// Renders all sibling names as `'a', 'b', 'c'` for diagnostics.
pub fn all_names(vars: &[VariableNode]) -> String {
    let mut out = String::new();
    for var in vars {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push('\'');
        out.push_str(&var.name);
        out.push('\'');
    }
    out
}

/// Returns the children of the SIMD lane with the given index, following the
/// `Lane {i}` naming convention, or None when that lane is absent.
pub fn lane(locals: &[VariableNode], index: usize) -> Option<&[VariableNode]> {
    find(locals, &format!("Lane {index}")).map(|v| v.children.as_slice())
}

/// Splits a dotted variable path into its segments.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Why a dotted-path walk failed. The caller owns message formatting since
/// the root case also needs the lane listing it resolved against.
#[derive(Debug, Clone, PartialEq)]
pub struct PathError {
    /// Path segments successfully resolved before the miss, dot-joined.
    /// Empty when the very first segment was missing.
    pub resolved: String,
    /// The segment that was not found.
    pub segment: String,
    /// Names of the siblings present at the failing level.
    pub siblings: String,
}

/// Walks a dotted path through nested children, one segment per level.
pub fn resolve_path<'a>(
    vars: &'a [VariableNode],
    path: &str,
) -> std::result::Result<&'a VariableNode, PathError> {
    let mut owner = vars;
    let mut resolved = String::new();
    let mut node: Option<&VariableNode> = None;
    for part in split_path(path) {
        match find(owner, part) {
            Some(var) => {
                owner = &var.children;
                if !resolved.is_empty() {
                    resolved.push('.');
                }
                resolved.push_str(part);
                node = Some(var);
            }
            None => {
                return Err(PathError {
                    resolved,
                    segment: part.to_string(),
                    siblings: all_names(owner),
                })
            }
        }
    }
    node.ok_or(PathError {
        resolved: String::new(),
        segment: path.to_string(),
        siblings: all_names(vars),
    })
}

/// Three-element index identifying a single compute invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalInvocationId {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GlobalInvocationId {
    /// Extracts an id from a composite variable via its `x`, `y`, `z`
    /// children. Any missing or unparseable child fails the extraction.
    pub fn extract(var: &VariableNode) -> Option<Self> {
        Some(Self {
            x: var.find("x")?.parse()?,
            y: var.find("y")?.parse()?,
            z: var.find("z")?.parse()?,
        })
    }
}

impl fmt::Display for GlobalInvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Two-element window-space index identifying a single fragment invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSpacePosition {
    pub x: u32,
    pub y: u32,
}

impl WindowSpacePosition {
    pub fn extract(var: &VariableNode) -> Option<Self> {
        Some(Self {
            x: var.find("x")?.parse()?,
            y: var.find("y")?.parse()?,
        })
    }
}

impl fmt::Display for WindowSpacePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A scalar kind the assertion API can expect a local to hold.
pub trait LocalValue: Sized + PartialEq + fmt::Display {
    fn extract(var: &VariableNode) -> Option<Self>;
}

impl LocalValue for i64 {
    fn extract(var: &VariableNode) -> Option<Self> {
        var.parse()
    }
}

impl LocalValue for f64 {
    fn extract(var: &VariableNode) -> Option<Self> {
        var.parse()
    }
}

impl LocalValue for String {
    fn extract(var: &VariableNode) -> Option<Self> {
        Some(var.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, value: &str) -> VariableNode {
        VariableNode {
            name: name.to_string(),
            value: value.to_string(),
            children: Vec::new(),
        }
    }

    fn node(name: &str, children: Vec<VariableNode>) -> VariableNode {
        VariableNode {
            name: name.to_string(),
            value: String::new(),
            children,
        }
    }

    #[test]
    fn find_and_all_names() {
        let vars = vec![leaf("x", "1"), leaf("y", "2")];
        assert_eq!(find(&vars, "y").unwrap().value, "2");
        assert!(find(&vars, "z").is_none());
        assert_eq!(all_names(&vars), "'x', 'y'");
    }

    #[test]
    fn lane_probing_stops_at_first_gap() {
        let locals = vec![
            node("Lane 0", vec![leaf("a", "1")]),
            node("Lane 1", vec![leaf("a", "2")]),
        ];
        assert!(lane(&locals, 0).is_some());
        assert!(lane(&locals, 1).is_some());
        assert!(lane(&locals, 2).is_none());
    }

    #[test]
    fn resolve_path_walks_nested_children() {
        let vars = vec![node("a", vec![node("b", vec![leaf("c", "42")])])];
        let var = resolve_path(&vars, "a.b.c").unwrap();
        assert_eq!(var.parse::<i64>(), Some(42));
    }

    #[test]
    fn resolve_path_reports_missing_segment_with_siblings() {
        let vars = vec![node("a", vec![node("b", vec![leaf("c", "42")])])];
        let err = resolve_path(&vars, "a.b.x").unwrap_err();
        assert_eq!(err.resolved, "a.b");
        assert_eq!(err.segment, "x");
        assert_eq!(err.siblings, "'c'");
    }

    #[test]
    fn resolve_path_reports_missing_root() {
        let vars = vec![leaf("a", "1")];
        let err = resolve_path(&vars, "nope").unwrap_err();
        assert_eq!(err.resolved, "");
        assert_eq!(err.segment, "nope");
        assert_eq!(err.siblings, "'a'");
    }

    #[test]
    fn global_invocation_id_extraction_requires_all_children() {
        let full = node("id", vec![leaf("x", "1"), leaf("y", "2"), leaf("z", "3")]);
        assert_eq!(
            GlobalInvocationId::extract(&full),
            Some(GlobalInvocationId { x: 1, y: 2, z: 3 })
        );

        let missing = node("id", vec![leaf("x", "1"), leaf("y", "2")]);
        assert_eq!(GlobalInvocationId::extract(&missing), None);

        let garbage = node(
            "id",
            vec![leaf("x", "1"), leaf("y", "oops"), leaf("z", "3")],
        );
        assert_eq!(GlobalInvocationId::extract(&garbage), None);
    }

    #[test]
    fn scalar_parse_failure_is_distinct_from_mismatch() {
        let var = leaf("n", "12x");
        assert_eq!(<i64 as LocalValue>::extract(&var), None);
        let var = leaf("n", " 12 ");
        assert_eq!(<i64 as LocalValue>::extract(&var), Some(12));
    }
}
