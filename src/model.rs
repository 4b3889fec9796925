//! Transaction, Span, and Error entities, their parent/child relations, and
//! the lifecycle invariants the trace engine maintains over them.
//!
//! The graph is a strict tree: a `Transaction` owns a `Vec<Span>` of direct
//! children, each `Span` owns its own `Vec<Span>` of children, and a parent
//! is identified only by its opaque id string (never a pointer or `Rc`).
//! Ownership transfers by move: when a transaction ends it is hooked out of
//! the engine's "current transaction" slot and handed to the flush queue by
//! value, which is what guarantees Testable Property 7 ("every transaction
//! handed to the queue is destroyed exactly once") for free in Rust, with no
//! explicit free step required.

use crate::ids;
use serde::Serialize;

/// `"success" | "failure"`; absence (`None`) marks a span as still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// One path segment plus value in a span's context map, e.g.
/// `("http", "status_code") -> Num(200.0)`. Models the source's variadic
/// nested-key-building calls as plain data instead of variadic dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Str(String),
    Num(f64),
}

/// A dotted path into a span's context tree, e.g. `["http", "status_code"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextPath(pub Vec<&'static str>);

impl ContextPath {
    pub fn new(segments: &[&'static str]) -> Self {
        ContextPath(segments.to_vec())
    }
}

/// Ordered key/value entries recorded against a span. Kept as an ordered
/// `Vec` rather than a `HashMap` so serialization order is deterministic,
/// which the test suite relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    entries: Vec<(ContextPath, ContextValue)>,
}

impl Context {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(&mut self, path: ContextPath, value: ContextValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(p, _)| *p == path) {
            slot.1 = value;
        } else {
            self.entries.push((path, value));
        }
    }

    pub fn set_str(&mut self, path: &[&'static str], value: impl Into<String>) {
        self.set(ContextPath::new(path), ContextValue::Str(value.into()));
    }

    pub fn set_num(&mut self, path: &[&'static str], value: f64) {
        self.set(ContextPath::new(path), ContextValue::Num(value));
    }

    pub fn entries(&self) -> &[(ContextPath, ContextValue)] {
        &self.entries
    }
}

/// A nested child of a transaction representing a sub-operation.
#[derive(Debug, Clone)]
pub struct Span {
    pub id: String,
    pub transaction_id: String,
    pub trace_id: String,
    pub parent_id: String,
    pub name: String,
    pub r#type: String,
    pub subtype: Option<String>,
    pub timestamp: u64,
    pub duration: Option<f64>,
    pub outcome: Option<Outcome>,
    pub children: Vec<Span>,
    pub context: Context,
}

impl Span {
    /// Construct a new span as a child of `parent_id`, inheriting
    /// transaction/trace ids as invariant 1 requires.
    pub fn new(
        transaction_id: &str,
        trace_id: &str,
        parent_id: &str,
        name: impl Into<String>,
        r#type: impl Into<String>,
        subtype: Option<String>,
    ) -> Self {
        Span {
            id: ids::transaction_id(),
            transaction_id: transaction_id.to_string(),
            trace_id: trace_id.to_string(),
            parent_id: parent_id.to_string(),
            name: name.into(),
            r#type: r#type.into(),
            subtype,
            timestamp: ids::now_micros(),
            duration: None,
            outcome: None,
            children: Vec::new(),
            context: Context::default(),
        }
    }

    /// A span is "pending" — the engine's insertion point — exactly while
    /// its outcome is unset.
    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn end(&mut self, outcome: Outcome) {
        let now = ids::now_micros();
        let micros = now.saturating_sub(self.timestamp);
        self.duration = Some(micros as f64 / 1000.0);
        self.outcome = Some(outcome);
    }

    /// Recursive descent into the rightmost child path, returning the
    /// innermost node whose outcome is still unset. Mirrors the "walk the
    /// children list to its last element, then recurse" algorithm exactly;
    /// returns `None` at any level whose child list is empty.
    pub fn deepest_pending_mut(&mut self) -> Option<&mut Span> {
        let path = pending_path(&self.children)?;
        Some(navigate_mut(&mut self.children, &path))
    }
}

/// Compute, under shared borrows only, the sequence of child indices that
/// leads to the innermost pending span: at each level take the last child;
/// if it's pending, record its index and descend into its own children for
/// something deeper still. Returns `None` if the last child at the top
/// level has already ended (per the LIFO invariant, nothing below can be
/// pending either) or if `children` is empty.
fn pending_path(children: &[Span]) -> Option<Vec<usize>> {
    let idx = children.len().checked_sub(1)?;
    let last = &children[idx];
    if !last.is_pending() {
        return None;
    }
    let mut path = vec![idx];
    if let Some(mut deeper) = pending_path(&last.children) {
        path.append(&mut deeper);
    }
    Some(path)
}

/// Walk `path` through nested `children` vectors to the mutable reference
/// it denotes. `path` is always non-empty and always valid for `children`
/// when produced by [`pending_path`] run against the same tree.
fn navigate_mut<'a>(children: &'a mut [Span], path: &[usize]) -> &'a mut Span {
    let (&first, rest) = path.split_first().expect("pending_path never returns empty");
    let mut node = &mut children[first];
    for &idx in rest {
        node = &mut node.children[idx];
    }
    node
}

/// A single captured exception stack frame.
#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub function: String,
    pub filename: String,
    /// The binary or shared object the frame's address falls within, used
    /// to default an `Error`'s `culprit` (distinct from `filename`, which
    /// is the resolved source-file location and is frequently empty).
    #[serde(skip)]
    pub binary: String,
}

/// The exception payload embedded in an `Error`.
#[derive(Debug, Clone)]
pub struct Exception {
    pub r#type: String,
    pub message: String,
    pub handled: bool,
    pub stacktrace: Vec<StackFrame>,
}

/// A captured exception attached to exactly one transaction.
#[derive(Debug, Clone)]
pub struct Error {
    pub id: String,
    pub transaction_id: String,
    pub trace_id: String,
    pub parent_id: String,
    pub culprit: Option<String>,
    pub timestamp: u64,
    pub exception: Exception,
}

/// The root of one distributed-trace unit of work within the process.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub r#type: String,
    pub timestamp: u64,
    pub duration: Option<f64>,
    pub outcome: Option<Outcome>,
    pub result: Option<String>,
    pub spans: Vec<Span>,
    pub errors: Vec<Error>,
    pub span_depth: u32,
    pub span_count: u32,
    pub span_dropped: u32,
}

impl Transaction {
    /// Begin a transaction. `trace_id` is inherited from an upstream
    /// traceparent when given, otherwise freshly generated (invariant: a
    /// transaction always has exactly one `trace_id`).
    pub fn begin(
        name: impl Into<String>,
        r#type: impl Into<String>,
        trace_id: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        Transaction {
            id: ids::transaction_id(),
            trace_id: trace_id.unwrap_or_else(ids::trace_id),
            parent_id,
            name: name.into(),
            r#type: r#type.into(),
            timestamp: ids::now_micros(),
            duration: None,
            outcome: None,
            result: None,
            spans: Vec::new(),
            errors: Vec::new(),
            span_depth: 0,
            span_count: 0,
            span_dropped: 0,
        }
    }

    pub fn end(&mut self, outcome: Outcome, result: Option<String>) {
        let now = ids::now_micros();
        let micros = now.saturating_sub(self.timestamp);
        self.duration = Some(micros as f64 / 1000.0);
        self.outcome = Some(outcome);
        self.result = result;
    }

    /// Recursive descent mirroring [`Span::deepest_pending_mut`], rooted at
    /// the transaction's direct children instead of a span's.
    pub fn deepest_pending_span_mut(&mut self) -> Option<&mut Span> {
        let path = pending_path(&self.spans)?;
        Some(navigate_mut(&mut self.spans, &path))
    }

    /// Id of whichever node (span or transaction) is currently the deepest
    /// pending insertion point — used both to parent a new span/error and
    /// to pick the `active_id` half of an outgoing `traceparent`.
    pub fn active_id(&mut self) -> String {
        match self.deepest_pending_span_mut() {
            Some(span) => span.id.clone(),
            None => self.id.clone(),
        }
    }

    /// Begin a new span under the deepest currently-pending span, or
    /// directly under the transaction if none is pending.
    pub fn begin_span(
        &mut self,
        name: impl Into<String>,
        r#type: impl Into<String>,
        subtype: Option<String>,
    ) -> &mut Span {
        let transaction_id = self.id.clone();
        let trace_id = self.trace_id.clone();
        self.span_count += 1;

        let parent_id = match self.deepest_pending_span_mut() {
            Some(parent) => {
                let parent_id = parent.id.clone();
                parent
                    .children
                    .push(Span::new(&transaction_id, &trace_id, &parent_id, name, r#type, subtype));
                return parent.children.last_mut().expect("just pushed");
            }
            None => transaction_id.clone(),
        };

        self.span_depth = 1;
        self.spans
            .push(Span::new(&transaction_id, &trace_id, &parent_id, name, r#type, subtype));
        self.spans.last_mut().expect("just pushed")
    }

    /// End the deepest pending span, if any. Returns `false` (a
    /// `PreconditionViolated`-worthy condition logged by the caller) when
    /// there is nothing pending to end.
    pub fn end_span(&mut self, outcome: Outcome) -> bool {
        let transaction_id = self.id.clone();
        match self.deepest_pending_span_mut() {
            Some(span) => {
                let was_direct_child = span.parent_id == transaction_id;
                span.end(outcome);
                if was_direct_child {
                    self.span_depth = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Attach an error, parenting it to the innermost pending span if any,
    /// else to the transaction itself (invariant 4: only between begin and
    /// end, enforced by the engine never handing out a reference to an
    /// ended transaction).
    pub fn catch_error(&mut self, mut error: Error) {
        error.transaction_id = self.id.clone();
        error.trace_id = self.trace_id.clone();
        error.parent_id = self.active_id();
        self.errors.push(error);
    }
}
