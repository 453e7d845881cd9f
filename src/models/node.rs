//! Node models
//!
//! A [`Node`] is one registered unit of the spec tree. Declaration calls hand
//! [`Node::new`] a bag of [`NodeArg`]s which is classified once, at the call
//! boundary, into a body and a decorator set.

use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cleanup::CleanupScope;
use crate::dsl::{Dsl, SpecContext};
use crate::error::DeclarationError;
use crate::models::CodeLocation;

/// Body of a container, run once while the tree is built
pub type ContainerFn = Box<dyn FnOnce(&mut Dsl)>;
/// Body of a setup or subject node
pub type SpecFn = Arc<dyn Fn(&SpecContext) + Send + Sync>;
/// First body of a synchronized before-suite node (primary process only)
pub type PrimaryFn = Arc<dyn Fn(&SpecContext) -> Vec<u8> + Send + Sync>;
/// Second body of a synchronized before-suite node (every process)
pub type AllProcessFn = Arc<dyn Fn(&SpecContext, &[u8]) + Send + Sync>;

/// Characters that may not appear in a label
const FORBIDDEN_LABEL_CHARS: &str = "&|!,()/";

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(1);

/// Role of a node in the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Container,
    BeforeEach,
    JustBeforeEach,
    AfterEach,
    JustAfterEach,
    BeforeAll,
    AfterAll,
    BeforeSuite,
    AfterSuite,
    SynchronizedBeforeSuite,
    SynchronizedAfterSuite,
    It,
    Cleanup,
}

impl NodeRole {
    pub fn name(&self) -> &'static str {
        match self {
            NodeRole::Container => "Container",
            NodeRole::BeforeEach => "BeforeEach",
            NodeRole::JustBeforeEach => "JustBeforeEach",
            NodeRole::AfterEach => "AfterEach",
            NodeRole::JustAfterEach => "JustAfterEach",
            NodeRole::BeforeAll => "BeforeAll",
            NodeRole::AfterAll => "AfterAll",
            NodeRole::BeforeSuite => "BeforeSuite",
            NodeRole::AfterSuite => "AfterSuite",
            NodeRole::SynchronizedBeforeSuite => "SynchronizedBeforeSuite",
            NodeRole::SynchronizedAfterSuite => "SynchronizedAfterSuite",
            NodeRole::It => "It",
            NodeRole::Cleanup => "DeferCleanup",
        }
    }

    /// Leaves cannot hold children
    pub fn is_leaf(&self) -> bool {
        !matches!(self, NodeRole::Container)
    }

    /// BeforeEach, JustBeforeEach, AfterEach and JustAfterEach
    pub fn is_each_hook(&self) -> bool {
        matches!(
            self,
            NodeRole::BeforeEach
                | NodeRole::JustBeforeEach
                | NodeRole::AfterEach
                | NodeRole::JustAfterEach
        )
    }

    pub fn is_all_hook(&self) -> bool {
        matches!(self, NodeRole::BeforeAll | NodeRole::AfterAll)
    }

    pub fn is_suite_level(&self) -> bool {
        self.is_before_suite() || self.is_after_suite()
    }

    pub fn is_before_suite(&self) -> bool {
        matches!(
            self,
            NodeRole::BeforeSuite | NodeRole::SynchronizedBeforeSuite
        )
    }

    pub fn is_after_suite(&self) -> bool {
        matches!(self, NodeRole::AfterSuite | NodeRole::SynchronizedAfterSuite)
    }

    /// Focus, Pending and Labels only make sense on containers and subjects
    fn accepts_selection_decorators(&self) -> bool {
        matches!(self, NodeRole::Container | NodeRole::It)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of labels attached to a node or passed to `run_specs`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(pub Vec<String>);

impl Labels {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(labels.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Trim a label and check that it can be used in filters
pub fn validate_label(label: &str) -> Result<String, &'static str> {
    let label = label.trim();
    if label.is_empty() {
        return Err("labels cannot be empty");
    }
    if label.chars().any(|c| FORBIDDEN_LABEL_CHARS.contains(c)) {
        return Err("labels cannot contain any of '&|!,()/'");
    }
    Ok(label.to_string())
}

/// A user-defined decorator carried on the node untouched
#[derive(Clone)]
pub struct CustomDecorator {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl CustomDecorator {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for CustomDecorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Custom({})", self.type_name)
    }
}

/// Modifiers applied to a node at declaration time
#[derive(Clone, Debug)]
pub enum Decorator {
    Focus,
    Pending,
    Ordered,
    Labels(Labels),
    Offset(usize),
    Location(CodeLocation),
    Custom(CustomDecorator),
}

impl Decorator {
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Decorator::Custom(CustomDecorator {
            type_name: type_name::<T>(),
            value: Arc::new(value),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Decorator::Focus => "Focus",
            Decorator::Pending => "Pending",
            Decorator::Ordered => "Ordered",
            Decorator::Labels(_) => "Label",
            Decorator::Offset(_) => "Offset",
            Decorator::Location(_) => "CodeLocation",
            Decorator::Custom(_) => "Custom",
        }
    }
}

/// Shorthand for `Decorator::Labels`
pub fn label<I, S>(labels: I) -> Decorator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Decorator::Labels(Labels::new(labels))
}

impl From<Labels> for Decorator {
    fn from(labels: Labels) -> Self {
        Decorator::Labels(labels)
    }
}

/// One argument of a declaration call
pub enum NodeArg {
    ContainerBody(ContainerFn),
    Body(SpecFn),
    SynchronizedBeforeSuite(PrimaryFn, AllProcessFn),
    SynchronizedAfterSuite(SpecFn, SpecFn),
    Decorator(Decorator),
    Unrecognized(&'static str),
}

impl NodeArg {
    pub fn container<F>(body: F) -> Self
    where
        F: FnOnce(&mut Dsl) + 'static,
    {
        NodeArg::ContainerBody(Box::new(body))
    }

    pub fn body<F>(body: F) -> Self
    where
        F: Fn(&SpecContext) + Send + Sync + 'static,
    {
        NodeArg::Body(Arc::new(body))
    }

    /// Classify a dynamically typed value.
    ///
    /// Accepts `NodeArg`, `Decorator`, `Labels` and `CodeLocation`; anything
    /// else becomes `Unrecognized` and is rejected by [`Node::new`].
    pub fn classify<T: Any>(value: T) -> Self {
        let name = type_name::<T>();
        let boxed: Box<dyn Any> = Box::new(value);
        let boxed = match boxed.downcast::<NodeArg>() {
            Ok(arg) => return *arg,
            Err(other) => other,
        };
        let boxed = match boxed.downcast::<Decorator>() {
            Ok(decorator) => return NodeArg::Decorator(*decorator),
            Err(other) => other,
        };
        let boxed = match boxed.downcast::<Labels>() {
            Ok(labels) => return NodeArg::Decorator(Decorator::Labels(*labels)),
            Err(other) => other,
        };
        match boxed.downcast::<CodeLocation>() {
            Ok(location) => NodeArg::Decorator(Decorator::Location(*location)),
            Err(_) => NodeArg::Unrecognized(name),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            NodeArg::ContainerBody(_) => "container",
            NodeArg::Body(_) => "spec",
            NodeArg::SynchronizedBeforeSuite(..) => "synchronized before-suite",
            NodeArg::SynchronizedAfterSuite(..) => "synchronized after-suite",
            NodeArg::Decorator(_) => "decorator",
            NodeArg::Unrecognized(_) => "unrecognized",
        }
    }
}

impl From<Decorator> for NodeArg {
    fn from(decorator: Decorator) -> Self {
        NodeArg::Decorator(decorator)
    }
}

impl From<Labels> for NodeArg {
    fn from(labels: Labels) -> Self {
        NodeArg::Decorator(Decorator::Labels(labels))
    }
}

impl fmt::Debug for NodeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeArg::Decorator(d) => write!(f, "NodeArg::Decorator({d:?})"),
            NodeArg::Unrecognized(t) => write!(f, "NodeArg::Unrecognized({t})"),
            other => write!(f, "NodeArg({})", other.kind()),
        }
    }
}

pub(crate) enum NodeBody {
    Container(Option<ContainerFn>),
    Spec(SpecFn),
    SynchronizedBeforeSuite {
        primary: PrimaryFn,
        all_processes: AllProcessFn,
    },
    SynchronizedAfterSuite {
        all_processes: SpecFn,
        primary: SpecFn,
    },
}

/// One registered behavior
pub struct Node {
    pub id: usize,
    pub role: NodeRole,
    pub text: String,
    pub location: CodeLocation,
    pub focused: bool,
    pub pending: bool,
    pub ordered: bool,
    pub labels: Vec<String>,
    pub custom: Vec<CustomDecorator>,
    /// Set on cleanup nodes only
    pub cleanup_scope: Option<CleanupScope>,
    pub(crate) body: NodeBody,
}

impl Node {
    /// Validate and classify the arguments of a declaration call.
    ///
    /// Every problem found in `args` is returned, not just the first.
    pub fn new(
        role: NodeRole,
        text: impl Into<String>,
        args: Vec<NodeArg>,
        location: CodeLocation,
    ) -> Result<Node, Vec<DeclarationError>> {
        let mut errors = Vec::new();
        let mut location = location;
        let mut body: Option<NodeBody> = None;
        let mut focused = false;
        let mut pending = false;
        let mut ordered = false;
        let mut labels = Vec::new();
        let mut custom = Vec::new();
        let mut offset = 0;

        let invalid = |decorator: &Decorator, location: &CodeLocation| {
            DeclarationError::InvalidDecorator {
                role,
                decorator: decorator.name(),
                location: location.clone(),
            }
        };

        for arg in args {
            let candidate = match arg {
                NodeArg::Decorator(decorator) => {
                    match &decorator {
                        Decorator::Focus if role.accepts_selection_decorators() => focused = true,
                        Decorator::Pending if role.accepts_selection_decorators() => pending = true,
                        Decorator::Ordered if role == NodeRole::Container => ordered = true,
                        Decorator::Labels(set) if role.accepts_selection_decorators() => {
                            for raw in set.iter() {
                                match validate_label(raw) {
                                    Ok(clean) if !labels.contains(&clean) => labels.push(clean),
                                    Ok(_) => {}
                                    Err(reason) => errors.push(DeclarationError::InvalidLabel {
                                        label: raw.clone(),
                                        reason,
                                        location: location.clone(),
                                    }),
                                }
                            }
                        }
                        Decorator::Offset(n) => offset = *n,
                        Decorator::Location(explicit) => location = explicit.clone(),
                        Decorator::Custom(c) => custom.push(c.clone()),
                        other => errors.push(invalid(other, &location)),
                    }
                    continue;
                }
                NodeArg::Unrecognized(type_name) => {
                    errors.push(DeclarationError::UnrecognizedArgument {
                        role,
                        type_name: type_name.to_string(),
                        location: location.clone(),
                    });
                    continue;
                }
                NodeArg::ContainerBody(f) if role == NodeRole::Container => {
                    NodeBody::Container(Some(f))
                }
                NodeArg::Body(f)
                    if !matches!(
                        role,
                        NodeRole::Container
                            | NodeRole::SynchronizedBeforeSuite
                            | NodeRole::SynchronizedAfterSuite
                    ) =>
                {
                    NodeBody::Spec(f)
                }
                NodeArg::SynchronizedBeforeSuite(primary, all_processes)
                    if role == NodeRole::SynchronizedBeforeSuite =>
                {
                    NodeBody::SynchronizedBeforeSuite {
                        primary,
                        all_processes,
                    }
                }
                NodeArg::SynchronizedAfterSuite(all_processes, primary)
                    if role == NodeRole::SynchronizedAfterSuite =>
                {
                    NodeBody::SynchronizedAfterSuite {
                        all_processes,
                        primary,
                    }
                }
                other => {
                    errors.push(DeclarationError::WrongBodyKind {
                        role,
                        body: other.kind(),
                        location: location.clone(),
                    });
                    continue;
                }
            };

            if body.is_some() {
                errors.push(DeclarationError::MultipleBodies {
                    role,
                    location: location.clone(),
                });
            } else {
                body = Some(candidate);
            }
        }

        if focused && pending {
            errors.push(DeclarationError::FocusedAndPending {
                role,
                location: location.clone(),
            });
        }

        let body = match body {
            Some(body) => body,
            None => {
                errors.push(DeclarationError::MissingBody {
                    role,
                    location: location.clone(),
                });
                return Err(errors);
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            role,
            text: text.into(),
            location: location.with_offset(offset),
            focused,
            pending,
            ordered,
            labels,
            custom,
            cleanup_scope: None,
            body,
        })
    }

    /// The synthetic container every top-level declaration hangs off
    pub(crate) fn root() -> Node {
        Node {
            id: 0,
            role: NodeRole::Container,
            text: String::new(),
            location: CodeLocation::default(),
            focused: false,
            pending: false,
            ordered: false,
            labels: Vec::new(),
            custom: Vec::new(),
            cleanup_scope: None,
            body: NodeBody::Container(None),
        }
    }

    /// Build the node that runs a deferred cleanup
    pub(crate) fn cleanup(scope: CleanupScope, body: SpecFn, location: CodeLocation) -> Node {
        Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            role: NodeRole::Cleanup,
            text: String::new(),
            location,
            focused: false,
            pending: false,
            ordered: false,
            labels: Vec::new(),
            custom: Vec::new(),
            cleanup_scope: Some(scope),
            body: NodeBody::Spec(body),
        }
    }

    /// Look up a custom decorator by type
    pub fn custom_decorator<T: Any>(&self) -> Option<&T> {
        self.custom.iter().find_map(|c| c.downcast_ref::<T>())
    }

    /// Text shown in reports; hooks are named after their role
    pub fn display_text(&self) -> &str {
        if self.text.is_empty() {
            self.role.name()
        } else {
            &self.text
        }
    }

    pub(crate) fn take_container_body(&mut self) -> Option<ContainerFn> {
        match &mut self.body {
            NodeBody::Container(body) => body.take(),
            _ => None,
        }
    }

    pub(crate) fn spec_body(&self) -> Option<&SpecFn> {
        match &self.body {
            NodeBody::Spec(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("text", &self.text)
            .field("location", &self.location)
            .field("focused", &self.focused)
            .field("pending", &self.pending)
            .field("ordered", &self.ordered)
            .field("labels", &self.labels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn here() -> CodeLocation {
        CodeLocation::new("node_test.rs", 1)
    }

    #[test]
    fn test_subject_with_decorators() {
        let node = Node::new(
            NodeRole::It,
            "works",
            vec![
                NodeArg::body(|_| {}),
                Decorator::Focus.into(),
                label(["fast", " db ", "fast"]).into(),
            ],
            here(),
        )
        .unwrap();

        assert!(node.focused);
        assert!(!node.pending);
        assert_eq!(node.labels, vec!["fast", "db"]);
    }

    #[test]
    fn test_errors_are_collected() {
        let errors = Node::new(
            NodeRole::It,
            "bad",
            vec![
                NodeArg::body(|_| {}),
                NodeArg::body(|_| {}),
                NodeArg::classify(42u8),
                Decorator::Ordered.into(),
            ],
            here(),
        )
        .unwrap_err();

        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .any(|e| matches!(e, DeclarationError::MultipleBodies { .. })));
        assert!(errors.iter().any(|e| matches!(
            e,
            DeclarationError::UnrecognizedArgument { type_name, .. } if type_name == "u8"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            DeclarationError::InvalidDecorator { decorator: "Ordered", .. }
        )));
    }

    #[test]
    fn test_focus_and_pending_conflict() {
        let errors = Node::new(
            NodeRole::Container,
            "both",
            vec![
                NodeArg::container(|_| {}),
                Decorator::Focus.into(),
                Decorator::Pending.into(),
            ],
            here(),
        )
        .unwrap_err();
        assert!(matches!(
            errors[0],
            DeclarationError::FocusedAndPending { .. }
        ));
    }

    #[test]
    fn test_missing_and_wrong_body() {
        let errors = Node::new(NodeRole::BeforeEach, "", vec![], here()).unwrap_err();
        assert!(matches!(errors[0], DeclarationError::MissingBody { .. }));

        let errors = Node::new(
            NodeRole::It,
            "x",
            vec![NodeArg::container(|_| {})],
            here(),
        )
        .unwrap_err();
        assert!(matches!(
            errors[0],
            DeclarationError::WrongBodyKind { body: "container", .. }
        ));
    }

    #[test]
    fn test_hooks_reject_selection_decorators() {
        let errors = Node::new(
            NodeRole::AfterEach,
            "",
            vec![NodeArg::body(|_| {}), Decorator::Pending.into()],
            here(),
        )
        .unwrap_err();
        assert!(matches!(
            errors[0],
            DeclarationError::InvalidDecorator { decorator: "Pending", .. }
        ));
    }

    #[test]
    fn test_invalid_label() {
        let errors = Node::new(
            NodeRole::It,
            "x",
            vec![NodeArg::body(|_| {}), label(["a|b"]).into()],
            here(),
        )
        .unwrap_err();
        assert!(matches!(errors[0], DeclarationError::InvalidLabel { .. }));
    }

    #[test]
    fn test_classify_and_location_override() {
        let explicit = CodeLocation::new("wrapper.rs", 99);
        let node = Node::new(
            NodeRole::It,
            "x",
            vec![
                NodeArg::classify(NodeArg::body(|_| {})),
                NodeArg::classify(explicit.clone()),
                Decorator::Offset(2).into(),
            ],
            here(),
        )
        .unwrap();
        assert_eq!(node.location.file, "wrapper.rs");
        assert_eq!(node.location.offset, 2);
    }

    #[test]
    fn test_custom_decorator_lookup() {
        #[derive(Debug, PartialEq)]
        struct Owner(&'static str);

        let node = Node::new(
            NodeRole::It,
            "x",
            vec![NodeArg::body(|_| {}), Decorator::custom(Owner("team-a")).into()],
            here(),
        )
        .unwrap();
        assert_eq!(node.custom_decorator::<Owner>(), Some(&Owner("team-a")));
        assert_eq!(node.display_text(), "x");
    }
}
