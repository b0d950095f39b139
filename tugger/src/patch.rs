//! JSON Patch construction for rewritten pods
//!
//! Every rewritten container gets a `replace` of its image and an annotation
//! holding the original. Once anything changed, the patch also makes sure the
//! annotation and label maps exist, injects the pull secret and marks the pod
//! with [`MODIFIED_LABEL`].

use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use serde_json::{Value, json};

pub const ORIGINAL_IMAGE_ANNOTATION: &str = "tugger-original-image";
pub const ORIGINAL_INIT_IMAGE_ANNOTATION: &str = "tugger-original-init-image";
pub const MODIFIED_LABEL: &str = "tugger-modified";

/// Which container list of the pod spec an index refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Container,
    Init,
}

impl ContainerKind {
    fn spec_field(self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Init => "initContainers",
        }
    }

    /// Annotation key preserving the original image of container `index`
    pub fn annotation_key(self, index: usize) -> String {
        match self {
            Self::Container => format!("{ORIGINAL_IMAGE_ANNOTATION}-{index}"),
            Self::Init => format!("{ORIGINAL_INIT_IMAGE_ANNOTATION}-{index}"),
        }
    }
}

/// The value shapes this webhook ever writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchValue {
    Text(String),
    Map(BTreeMap<String, String>),
    /// Names rendered as `[{"name": ...}]`, as `imagePullSecrets` expects
    References(Vec<String>),
}

impl From<PatchValue> for Value {
    fn from(value: PatchValue) -> Self {
        match value {
            PatchValue::Text(text) => Value::String(text),
            PatchValue::Map(map) => json!(map),
            PatchValue::References(names) => names
                .into_iter()
                .map(|name| json!({ "name": name }))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOp {
    pub op: Op,
    pub path: PointerBuf,
    pub value: PatchValue,
}

impl PatchOp {
    fn add(path: PointerBuf, value: PatchValue) -> Self {
        Self {
            op: Op::Add,
            path,
            value,
        }
    }

    fn replace(path: PointerBuf, value: PatchValue) -> Self {
        Self {
            op: Op::Replace,
            path,
            value,
        }
    }
}

impl From<PatchOp> for PatchOperation {
    fn from(op: PatchOp) -> Self {
        let value = Value::from(op.value);
        match op.op {
            Op::Add => PatchOperation::Add(AddOperation {
                path: op.path,
                value,
            }),
            Op::Replace => PatchOperation::Replace(ReplaceOperation {
                path: op.path,
                value,
            }),
        }
    }
}

/// What the pod already has, which decides the map-creating ops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodMetadata {
    pub has_annotations: bool,
    pub has_labels: bool,
}

/// Ordered patch operations, applied by the API server as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchDocument {
    ops: Vec<PatchOp>,
}

impl PatchDocument {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn into_json_patch(self) -> Patch {
        Patch(self.ops.into_iter().map(PatchOperation::from).collect())
    }
}

/// Accumulates image rewrites for one pod
#[derive(Debug, Default)]
pub struct PatchBuilder {
    ops: Vec<PatchOp>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the image of container `index` and annotates the original
    pub fn rewrite_image(
        &mut self,
        kind: ContainerKind,
        index: usize,
        original: &str,
        image: &str,
    ) {
        let index_token = index.to_string();
        let annotation = kind.annotation_key(index);
        self.ops.push(PatchOp::replace(
            PointerBuf::from_tokens(["spec", kind.spec_field(), index_token.as_str(), "image"]),
            PatchValue::Text(image.to_string()),
        ));
        self.ops.push(PatchOp::add(
            PointerBuf::from_tokens(["metadata", "annotations", annotation.as_str()]),
            PatchValue::Text(original.to_string()),
        ));
    }

    /// Completes the document; an untouched pod yields an empty one
    pub fn finish(self, pod: PodMetadata, pull_secret: Option<&str>) -> PatchDocument {
        if self.ops.is_empty() {
            return PatchDocument::default();
        }

        let mut ops = Vec::with_capacity(self.ops.len() + 4);

        // must precede every add addressed inside the annotations map
        if !pod.has_annotations {
            ops.push(PatchOp::add(
                PointerBuf::from_tokens(["metadata", "annotations"]),
                PatchValue::Map(BTreeMap::new()),
            ));
        }
        ops.extend(self.ops);

        if !pod.has_labels {
            ops.push(PatchOp::add(
                PointerBuf::from_tokens(["metadata", "labels"]),
                PatchValue::Map(BTreeMap::new()),
            ));
        }
        if let Some(secret) = pull_secret {
            ops.push(PatchOp::add(
                PointerBuf::from_tokens(["spec", "imagePullSecrets"]),
                PatchValue::References(vec![secret.to_string()]),
            ));
        }
        ops.push(PatchOp::add(
            PointerBuf::from_tokens(["metadata", "labels", MODIFIED_LABEL]),
            PatchValue::Text("true".into()),
        ));

        PatchDocument { ops }
    }
}
