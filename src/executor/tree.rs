//! Spec tree assembly
//!
//! [`TreeBuilder`] takes the top-level nodes recorded by a session, runs
//! container bodies so nested declarations land under the open container,
//! and validates where each node may appear. [`Tree`] is the built result,
//! flattened into the list of specs the executor walks.

use std::sync::Arc;
use tracing::debug;

use crate::config::SuiteConfig;
use crate::deprecation::DeprecationTracker;
use crate::dsl::Dsl;
use crate::error::DeclarationError;
use crate::models::{Node, NodeRole};

const ROOT: usize = 0;

struct Slot {
    node: Node,
    parent: usize,
    children: Vec<usize>,
}

pub struct TreeBuilder {
    arena: Vec<Slot>,
    cursor: Vec<usize>,
    errors: Vec<DeclarationError>,
    deprecations: Arc<DeprecationTracker>,
}

impl TreeBuilder {
    pub fn new(deprecations: Arc<DeprecationTracker>) -> Self {
        Self {
            arena: vec![Slot {
                node: Node::root(),
                parent: ROOT,
                children: Vec::new(),
            }],
            cursor: vec![ROOT],
            errors: Vec::new(),
            deprecations,
        }
    }

    pub fn deprecations(&self) -> &DeprecationTracker {
        &self.deprecations
    }

    /// Add a node under the open container, running its body if it is one
    pub fn push(&mut self, mut node: Node) {
        let parent = self.cursor.last().copied().unwrap_or(ROOT);
        if let Err(err) = self.validate(&node, parent) {
            self.errors.push(err);
            return;
        }

        debug!("declared {} {:?} at {}", node.role, node.text, node.location);
        let body = node.take_container_body();
        let index = self.arena.len();
        self.arena.push(Slot {
            node,
            parent,
            children: Vec::new(),
        });
        self.arena[parent].children.push(index);

        if let Some(body) = body {
            self.cursor.push(index);
            body(&mut Dsl::new(self));
            self.cursor.pop();
        }
    }

    pub fn record_errors(&mut self, errors: Vec<DeclarationError>) {
        self.errors.extend(errors);
    }

    fn validate(&self, node: &Node, parent: usize) -> Result<(), DeclarationError> {
        let parent_role = self.arena[parent].node.role;
        if parent_role != NodeRole::Container || node.role == NodeRole::Cleanup {
            return Err(DeclarationError::InvalidNesting {
                role: node.role,
                parent: parent_role,
                location: node.location.clone(),
            });
        }

        if node.role.is_suite_level() {
            if parent != ROOT {
                return Err(DeclarationError::SuiteNodeNotAtTopLevel {
                    role: node.role,
                    location: node.location.clone(),
                });
            }
            let conflict = self.arena[ROOT]
                .children
                .iter()
                .map(|&i| &self.arena[i].node)
                .find(|existing| {
                    (existing.role.is_before_suite() && node.role.is_before_suite())
                        || (existing.role.is_after_suite() && node.role.is_after_suite())
                });
            if let Some(existing) = conflict {
                return Err(DeclarationError::DuplicateSuiteNode {
                    role: node.role,
                    existing: existing.role,
                    existing_location: existing.location.clone(),
                    location: node.location.clone(),
                });
            }
        }

        if node.role.is_all_hook() && !self.chain(parent).any(|i| self.arena[i].node.ordered) {
            return Err(DeclarationError::OutsideOrderedContainer {
                role: node.role,
                location: node.location.clone(),
            });
        }
        Ok(())
    }

    /// `index` and its ancestors, innermost first, excluding the root
    fn chain(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        let mut next = Some(index);
        std::iter::from_fn(move || {
            let current = next.filter(|&i| i != ROOT)?;
            next = Some(self.arena[current].parent);
            Some(current)
        })
    }

    pub fn build(self) -> Result<Tree, Vec<DeclarationError>> {
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        let mut tree = Tree {
            arena: self.arena,
            specs: Vec::new(),
        };
        tree.flatten(ROOT, &mut Vec::new());
        Ok(tree)
    }
}

/// Why a spec will or will not run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Run,
    Pending,
    Skipped(String),
}

/// One subject together with the containers it is nested in
#[derive(Clone, Debug)]
pub struct Spec {
    pub subject: usize,
    /// Container indices, outermost first
    pub containers: Vec<usize>,
    /// Outermost Ordered container, which defines the spec's group
    pub ordered_root: Option<usize>,
    pub labels: Vec<String>,
    pub pending: bool,
    pub focused: bool,
    pub disposition: Disposition,
}

pub struct Tree {
    arena: Vec<Slot>,
    specs: Vec<Spec>,
}

impl Tree {
    pub fn node(&self, index: usize) -> &Node {
        &self.arena[index].node
    }

    pub fn specs(&self) -> &[Spec] {
        &self.specs
    }

    pub fn spec(&self, index: usize) -> &Spec {
        &self.specs[index]
    }

    pub fn before_suite(&self) -> Option<usize> {
        self.top_level(NodeRole::is_before_suite)
    }

    pub fn after_suite(&self) -> Option<usize> {
        self.top_level(NodeRole::is_after_suite)
    }

    fn top_level(&self, matches: fn(&NodeRole) -> bool) -> Option<usize> {
        self.arena[ROOT]
            .children
            .iter()
            .copied()
            .find(|&i| matches(&self.arena[i].node.role))
    }

    fn flatten(&mut self, index: usize, containers: &mut Vec<usize>) {
        let children = self.arena[index].children.clone();
        for child in children {
            match self.arena[child].node.role {
                NodeRole::Container => {
                    containers.push(child);
                    self.flatten(child, containers);
                    containers.pop();
                }
                NodeRole::It => {
                    let spec = self.describe_spec(child, containers);
                    self.specs.push(spec);
                }
                _ => {}
            }
        }
    }

    fn describe_spec(&self, subject: usize, containers: &[usize]) -> Spec {
        let chain = || {
            containers
                .iter()
                .map(|&i| &self.arena[i].node)
                .chain(std::iter::once(&self.arena[subject].node))
        };
        let mut labels: Vec<String> = Vec::new();
        for label in chain().flat_map(|n| n.labels.iter()) {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        let pending = chain().any(|n| n.pending);
        Spec {
            subject,
            containers: containers.to_vec(),
            ordered_root: containers
                .iter()
                .copied()
                .find(|&i| self.arena[i].node.ordered),
            labels,
            pending,
            focused: !pending && chain().any(|n| n.focused),
            disposition: if pending {
                Disposition::Pending
            } else {
                Disposition::Run
            },
        }
    }

    /// Decide which specs run. Returns true when programmatic focus applies.
    ///
    /// Command-line focus, skip and label filters take precedence over
    /// programmatic focus, which is then ignored.
    pub fn apply_filters(&mut self, config: &SuiteConfig, suite_labels: &[String]) -> bool {
        let filtered = !config.focus_strings.is_empty()
            || !config.skip_strings.is_empty()
            || !config.label_filter.is_empty();
        let has_programmatic_focus = !filtered && self.specs.iter().any(|s| s.focused);

        for i in 0..self.specs.len() {
            if self.specs[i].pending {
                continue;
            }
            let text = self.full_text(&self.specs[i]);
            let spec = &self.specs[i];
            let reason = if filtered {
                if !config.focus_strings.is_empty()
                    && !config.focus_strings.iter().any(|f| text.contains(f.as_str()))
                {
                    Some("does not match --grove.focus")
                } else if config.skip_strings.iter().any(|s| text.contains(s.as_str())) {
                    Some("matches --grove.skip")
                } else if !config.label_filter.is_empty()
                    && !config.label_filter.iter().any(|wanted| {
                        spec.labels.contains(wanted) || suite_labels.contains(wanted)
                    })
                {
                    Some("does not match --grove.label-filter")
                } else {
                    None
                }
            } else if has_programmatic_focus && !spec.focused {
                Some("not focused")
            } else {
                None
            };

            self.specs[i].disposition = match reason {
                Some(reason) => Disposition::Skipped(reason.to_string()),
                None => Disposition::Run,
            };
        }
        has_programmatic_focus
    }

    pub fn container_texts(&self, spec: &Spec) -> Vec<String> {
        spec.containers
            .iter()
            .map(|&i| self.arena[i].node.text.clone())
            .collect()
    }

    pub fn full_text(&self, spec: &Spec) -> String {
        let mut parts = self.container_texts(spec);
        parts.push(self.arena[spec.subject].node.text.clone());
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    /// Per-spec hooks of `role` in run order: outer to inner for setup,
    /// inner to outer for teardown
    pub fn each_hooks(&self, spec: &Spec, role: NodeRole) -> Vec<usize> {
        let mut scopes = vec![ROOT];
        scopes.extend(spec.containers.iter().copied());
        let mut hooks: Vec<usize> = scopes
            .into_iter()
            .flat_map(|c| self.children_with_role(c, role))
            .collect();
        if matches!(role, NodeRole::AfterEach | NodeRole::JustAfterEach) {
            hooks.reverse();
        }
        hooks
    }

    /// BeforeAll/AfterAll hooks that apply to `spec`, in run order
    pub fn all_hooks(&self, spec: &Spec, role: NodeRole) -> Vec<usize> {
        let Some(root) = spec.ordered_root else {
            return Vec::new();
        };
        let mut hooks: Vec<usize> = spec
            .containers
            .iter()
            .copied()
            .skip_while(|&c| c != root)
            .flat_map(|c| self.children_with_role(c, role))
            .collect();
        if role == NodeRole::AfterAll {
            hooks.reverse();
        }
        hooks
    }

    fn children_with_role(&self, container: usize, role: NodeRole) -> Vec<usize> {
        self.arena[container]
            .children
            .iter()
            .copied()
            .filter(|&i| self.arena[i].node.role == role)
            .collect()
    }

    /// Spec indices grouped for scheduling: the specs of one Ordered
    /// container stay together, every other spec is its own group
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut open: Option<usize> = None;
        for (i, spec) in self.specs.iter().enumerate() {
            match (spec.ordered_root, open) {
                (Some(root), Some(current)) if root == current => {
                    if let Some(group) = groups.last_mut() {
                        group.push(i);
                    }
                }
                (root, _) => {
                    groups.push(vec![i]);
                    open = root;
                }
            }
        }
        groups
    }

    pub fn specs_that_will_run(&self) -> usize {
        self.specs
            .iter()
            .filter(|s| s.disposition == Disposition::Run)
            .count()
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::dsl::Declare;
    use crate::models::{CodeLocation, Decorator, NodeArg};

    fn build(declare: impl FnOnce(&mut Dsl)) -> Result<Tree, Vec<DeclarationError>> {
        let mut builder = TreeBuilder::new(Arc::new(DeprecationTracker::new()));
        declare(&mut Dsl::new(&mut builder));
        builder.build()
    }

    fn texts(tree: &Tree, hooks: &[usize]) -> Vec<String> {
        hooks.iter().map(|&i| tree.node(i).text.clone()).collect()
    }

    #[test]
    fn test_flatten_and_hook_order() {
        let tree = build(|d| {
            d.declare(NodeRole::BeforeEach, "outer-before", vec![NodeArg::body(|_| {})]);
            d.describe("A", |d| {
                d.declare(NodeRole::AfterEach, "a-after", vec![NodeArg::body(|_| {})]);
                d.context("B", |d| {
                    d.declare(NodeRole::BeforeEach, "b-before", vec![NodeArg::body(|_| {})]);
                    d.declare(NodeRole::AfterEach, "b-after", vec![NodeArg::body(|_| {})]);
                    d.it("works", |_| {});
                });
                d.it("also works", |_| {});
            });
        })
        .unwrap();

        assert_eq!(tree.specs().len(), 2);
        let spec = tree.spec(0);
        assert_eq!(tree.full_text(spec), "A B works");
        assert_eq!(
            texts(&tree, &tree.each_hooks(spec, NodeRole::BeforeEach)),
            vec!["outer-before", "b-before"]
        );
        assert_eq!(
            texts(&tree, &tree.each_hooks(spec, NodeRole::AfterEach)),
            vec!["b-after", "a-after"]
        );
        assert_eq!(tree.groups(), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_pending_ancestry_beats_focus() {
        let mut tree = build(|d| {
            d.pdescribe("later", |d| {
                d.fit("focused but pending", |_| {});
            });
            d.it("plain", |_| {});
        })
        .unwrap();

        let has_focus = tree.apply_filters(&SuiteConfig::default(), &[]);
        assert!(!has_focus);
        assert_eq!(tree.spec(0).disposition, Disposition::Pending);
        assert_eq!(tree.spec(1).disposition, Disposition::Run);
    }

    #[test]
    fn test_programmatic_focus_skips_others() {
        let mut tree = build(|d| {
            d.fdescribe("focused", |d| {
                d.it("inside", |_| {});
            });
            d.it("outside", |_| {});
        })
        .unwrap();

        assert!(tree.apply_filters(&SuiteConfig::default(), &[]));
        assert_eq!(tree.spec(0).disposition, Disposition::Run);
        assert_eq!(
            tree.spec(1).disposition,
            Disposition::Skipped("not focused".into())
        );
        assert_eq!(tree.specs_that_will_run(), 1);
    }

    #[test]
    fn test_container_focus_reaches_every_descendant() {
        let mut tree = build(|d| {
            d.fdescribe("outer", |d| {
                d.fit("chosen", |_| {});
                d.it("sibling", |_| {});
                d.pit("parked", |_| {});
            });
            d.it("outside", |_| {});
        })
        .unwrap();

        assert!(tree.apply_filters(&SuiteConfig::default(), &[]));
        assert_eq!(tree.spec(0).disposition, Disposition::Run);
        assert_eq!(tree.spec(1).disposition, Disposition::Run);
        assert_eq!(tree.spec(2).disposition, Disposition::Pending);
        assert_eq!(
            tree.spec(3).disposition,
            Disposition::Skipped("not focused".into())
        );
        assert_eq!(tree.specs_that_will_run(), 2);
    }

    #[test]
    fn test_command_line_filters_override_focus() {
        let mut tree = build(|d| {
            d.fit("focused", |_| {});
            d.it_with("db spec", [crate::models::label(["db"])], |_| {});
            d.it("other spec", |_| {});
        })
        .unwrap();

        let config = SuiteConfig {
            label_filter: vec!["db".into()],
            ..SuiteConfig::default()
        };
        assert!(!tree.apply_filters(&config, &[]));
        assert!(matches!(tree.spec(0).disposition, Disposition::Skipped(_)));
        assert_eq!(tree.spec(1).disposition, Disposition::Run);

        let config = SuiteConfig {
            skip_strings: vec!["other".into()],
            ..SuiteConfig::default()
        };
        tree.apply_filters(&config, &[]);
        assert_eq!(tree.spec(0).disposition, Disposition::Run);
        assert!(matches!(tree.spec(2).disposition, Disposition::Skipped(_)));
    }

    #[test]
    fn test_ordered_groups_and_all_hooks() {
        let tree = build(|d| {
            d.it("first", |_| {});
            d.describe_with("flow", [Decorator::Ordered], |d| {
                d.before_all(|_| {});
                d.it("step 1", |_| {});
                d.context("nested", |d| {
                    d.after_all(|_| {});
                    d.it("step 2", |_| {});
                });
            });
            d.it("last", |_| {});
        })
        .unwrap();

        assert_eq!(tree.groups(), vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(tree.all_hooks(tree.spec(1), NodeRole::BeforeAll).len(), 1);
        assert_eq!(tree.all_hooks(tree.spec(1), NodeRole::AfterAll).len(), 0);
        assert_eq!(tree.all_hooks(tree.spec(2), NodeRole::AfterAll).len(), 1);
    }

    #[test]
    fn test_structural_errors_are_collected() {
        let errors = build(|d| {
            d.before_all(|_| {});
            d.describe("suite nodes", |d| {
                d.before_suite(|_| {});
            });
            d.before_suite(|_| {});
            d.synchronized_before_suite(|_| Vec::new(), |_, _| {});
        })
        .err()
        .unwrap();

        assert_eq!(errors.len(), 3);
        assert!(matches!(
            errors[0],
            DeclarationError::OutsideOrderedContainer { .. }
        ));
        assert!(matches!(
            errors[1],
            DeclarationError::SuiteNodeNotAtTopLevel { .. }
        ));
        assert!(matches!(
            errors[2],
            DeclarationError::DuplicateSuiteNode {
                existing: NodeRole::BeforeSuite,
                ..
            }
        ));
    }

    #[test]
    fn test_cleanup_nodes_cannot_be_declared() {
        let mut builder = TreeBuilder::new(Arc::new(DeprecationTracker::new()));
        let node = Node::new(
            NodeRole::Cleanup,
            "",
            vec![NodeArg::body(|_| {})],
            CodeLocation::new("x.rs", 1),
        )
        .unwrap();
        builder.push(node);
        let errors = builder.build().err().unwrap();
        assert!(matches!(
            errors[0],
            DeclarationError::InvalidNesting {
                role: NodeRole::Cleanup,
                ..
            }
        ));
    }
}
