//! The map-function capability seam.
//!
//! The embeddable scripting runtime that evaluates view sources lives
//! outside this repository; the refresh engine only depends on the
//! [`MapFunction`] capability. [`FnMapRuntime`] adapts plain closures,
//! which is how tests (and embedders without a script engine) register
//! map functions.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use snafu::Snafu;

use crate::ddoc::Emit;

/// Errors surfaced by map runtimes.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MapError {
    /// The view source did not compile.
    #[snafu(display("map function failed to compile: {message}"))]
    Compile {
        /// Runtime-provided description.
        message: String,
    },

    /// Evaluation of a document failed.
    #[snafu(display("map function evaluation failed: {message}"))]
    Evaluate {
        /// Runtime-provided description.
        message: String,
    },
}

/// How a document body was presented to the map function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    /// The body parsed as JSON.
    Json,
    /// The body did not parse; it was base64-encoded instead.
    Base64,
}

impl DocType {
    /// The `meta.type` string handed to map functions.
    pub fn as_str(self) -> &'static str {
        match self {
            DocType::Json => "json",
            DocType::Base64 => "base64",
        }
    }
}

/// The `meta` argument of a map invocation.
#[derive(Debug, Clone)]
pub struct DocMeta {
    /// Document key as a string.
    pub id: String,
    /// Presentation of the body.
    pub doc_type: DocType,
}

/// Presents a document body to map functions: parsed JSON when
/// possible, a base64 string otherwise.
pub fn parse_doc(data: &[u8]) -> (Value, DocType) {
    match serde_json::from_slice(data) {
        Ok(v) => (v, DocType::Json),
        Err(_) => (Value::String(STANDARD.encode(data)), DocType::Base64),
    }
}

/// A compiled map function.
pub trait MapFunction: Send + Sync {
    /// Runs the function over one document, returning its emits in
    /// order. The host fills in [`Emit::id`] afterwards.
    fn evaluate(&self, doc: &Value, meta: &DocMeta) -> Result<Vec<Emit>, MapError>;
}

/// Compiles view sources into map functions. One compile per view per
/// refresh run; the engine reuses the result across documents.
pub trait MapRuntime: Send + Sync {
    /// Compiles the `map` source of `ddoc_id`/`view_id`.
    fn compile(
        &self,
        ddoc_id: &str,
        view_id: &str,
        source: &str,
    ) -> Result<Arc<dyn MapFunction>, MapError>;
}

/// A map function backed by a plain closure.
pub struct FnMapFunction {
    f: Box<dyn Fn(&Value, &DocMeta) -> Vec<Emit> + Send + Sync>,
}

impl FnMapFunction {
    /// Wraps a closure as a map function.
    pub fn new(f: impl Fn(&Value, &DocMeta) -> Vec<Emit> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(FnMapFunction { f: Box::new(f) })
    }
}

impl MapFunction for FnMapFunction {
    fn evaluate(&self, doc: &Value, meta: &DocMeta) -> Result<Vec<Emit>, MapError> {
        Ok((self.f)(doc, meta))
    }
}

/// A runtime that resolves every source through one closure.
pub struct FnMapRuntime {
    compile: Box<dyn Fn(&str) -> Result<Arc<dyn MapFunction>, MapError> + Send + Sync>,
}

impl FnMapRuntime {
    /// Builds a runtime from a source-to-function closure.
    pub fn new(
        compile: impl Fn(&str) -> Result<Arc<dyn MapFunction>, MapError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(FnMapRuntime { compile: Box::new(compile) })
    }

    /// A runtime that ignores sources and always evaluates `f`.
    pub fn constant(
        f: impl Fn(&Value, &DocMeta) -> Vec<Emit> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let func: Arc<dyn MapFunction> = FnMapFunction::new(f);
        Self::new(move |_| Ok(func.clone()))
    }
}

impl MapRuntime for FnMapRuntime {
    fn compile(
        &self,
        _ddoc_id: &str,
        _view_id: &str,
        source: &str,
    ) -> Result<Arc<dyn MapFunction>, MapError> {
        (self.compile)(source)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_doc_json() {
        let (doc, ty) = parse_doc(br#"{"tag":"x"}"#);
        assert_eq!(ty, DocType::Json);
        assert_eq!(doc["tag"], "x");
    }

    #[test]
    fn parse_doc_binary_falls_back_to_base64() {
        let (doc, ty) = parse_doc(&[0xff, 0xfe, 0x00]);
        assert_eq!(ty, DocType::Base64);
        let Value::String(s) = doc else { panic!("expected string doc") };
        assert_eq!(STANDARD.decode(s).unwrap(), vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn fn_runtime_compiles_and_evaluates() {
        let rt = FnMapRuntime::constant(|doc, meta| {
            vec![Emit { id: String::new(), key: doc["tag"].clone(), value: json!(meta.id) }]
        });
        let f = rt.compile("_design/d", "v", "whatever").unwrap();
        let meta = DocMeta { id: "k1".to_string(), doc_type: DocType::Json };
        let emits = f.evaluate(&json!({"tag": "x"}), &meta).unwrap();
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].key, json!("x"));
        assert_eq!(emits[0].value, json!("k1"));
    }
}
