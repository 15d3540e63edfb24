//! Operation dispatch
//!
//! The runner never reflects over the backend. Each backend type
//! contributes an explicit [`OpTable`]: a mapping from method name to a
//! handler. Handlers registered through [`OpTable::register`] receive their
//! parameters as a typed struct deserialized from the request's `params`
//! mapping, so a shape mismatch surfaces as a parameter error rather than
//! reaching the operation at all. A request without params deserializes
//! against `()`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// An error raised by the backend itself. Code, message, and data are
/// forwarded to the peer unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct DomainError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl DomainError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Outcome of invoking a single operation.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// Backend-raised error; answered with its own code/message/data.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The supplied params did not match the shape the operation expects.
    /// Answered as a parse error.
    #[error("{0}")]
    Params(String),

    /// Anything else. Reported as a generic plugin fault and terminates
    /// the session.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

type Handler<B> =
    Box<dyn Fn(&mut B, Option<&Map<String, Value>>) -> Result<Value, OpError> + Send>;

/// Explicit mapping from method name to handler for one backend type.
pub struct OpTable<B> {
    handlers: HashMap<String, Handler<B>>,
}

impl<B> OpTable<B> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a typed operation.
    ///
    /// `params = null` (or absent) deserializes against `P`, so `P = ()`
    /// declares a zero-argument operation and `P = Option<T>` one with
    /// optional arguments. A params mapping that does not fit `P` is
    /// rejected before the operation runs.
    pub fn register<P, R, F>(&mut self, method: &str, op: F)
    where
        B: 'static,
        P: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(&mut B, P) -> Result<R, DomainError> + Send + 'static,
    {
        let method_name = method.to_string();
        let handler = move |backend: &mut B, params: Option<&Map<String, Value>>| {
            let raw = match params {
                Some(map) => Value::Object(map.clone()),
                None => Value::Null,
            };
            let parsed: P = serde_json::from_value(raw).map_err(|e| {
                OpError::Params(format!("parameters for {method_name} do not match: {e}"))
            })?;
            let result = op(backend, parsed)?;
            serde_json::to_value(result).map_err(|e| {
                OpError::Internal(anyhow::anyhow!(
                    "result of {method_name} failed to serialize: {e}"
                ))
            })
        };
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    /// Register an operation that wants the params mapping untouched and
    /// full control over its error taxonomy.
    pub fn register_raw<F>(&mut self, method: &str, op: F)
    where
        F: Fn(&mut B, Option<&Map<String, Value>>) -> Result<Value, OpError> + Send + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(op));
    }

    /// Capability query: does the backend expose this operation?
    pub fn supports(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Invoke a registered operation.
    pub fn invoke(
        &self,
        backend: &mut B,
        method: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<Value, OpError> {
        match self.handlers.get(method) {
            Some(handler) => handler(backend, params),
            None => Err(OpError::Internal(anyhow::anyhow!(
                "no handler registered for {method}"
            ))),
        }
    }

    /// Registered method names, in no particular order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<B> Default for OpTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        calls: usize,
    }

    #[derive(Deserialize)]
    struct GrowParams {
        by: usize,
    }

    fn table() -> OpTable<Counter> {
        let mut ops = OpTable::new();
        ops.register("bump", |c: &mut Counter, (): ()| {
            c.calls += 1;
            Ok(c.calls)
        });
        ops.register("grow", |c: &mut Counter, p: GrowParams| {
            c.calls += p.by;
            Ok(c.calls)
        });
        ops.register("refuse", |_c: &mut Counter, (): ()| -> Result<(), DomainError> {
            Err(DomainError::with_data(50, "disk full", json!({"foo": 1})))
        });
        ops
    }

    #[test]
    fn nullary_op_runs_without_params() {
        let ops = table();
        let mut counter = Counter::default();
        let out = ops.invoke(&mut counter, "bump", None).unwrap();
        assert_eq!(out, json!(1));
        assert_eq!(counter.calls, 1);
    }

    #[test]
    fn named_params_reach_the_op() {
        let ops = table();
        let mut counter = Counter::default();
        let params = match json!({"by": 5}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let out = ops.invoke(&mut counter, "grow", Some(&params)).unwrap();
        assert_eq!(out, json!(5));
    }

    #[test]
    fn params_for_a_nullary_op_are_a_mismatch() {
        let ops = table();
        let mut counter = Counter::default();
        let params = match json!({"unexpected": true}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = ops.invoke(&mut counter, "bump", Some(&params)).unwrap_err();
        assert!(matches!(err, OpError::Params(_)));
        assert_eq!(counter.calls, 0);
    }

    #[test]
    fn missing_params_for_a_typed_op_are_a_mismatch() {
        let ops = table();
        let mut counter = Counter::default();
        let err = ops.invoke(&mut counter, "grow", None).unwrap_err();
        assert!(matches!(err, OpError::Params(_)));
    }

    #[test]
    fn wrong_field_shape_is_a_mismatch() {
        let ops = table();
        let mut counter = Counter::default();
        let params = match json!({"by": "many"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = ops.invoke(&mut counter, "grow", Some(&params)).unwrap_err();
        match err {
            OpError::Params(detail) => assert!(detail.contains("grow")),
            other => panic!("expected Params, got {other:?}"),
        }
    }

    #[test]
    fn domain_errors_pass_through_untouched() {
        let ops = table();
        let mut counter = Counter::default();
        let err = ops.invoke(&mut counter, "refuse", None).unwrap_err();
        match err {
            OpError::Domain(domain) => {
                assert_eq!(domain.code, 50);
                assert_eq!(domain.message, "disk full");
                assert_eq!(domain.data, Some(json!({"foo": 1})));
            }
            other => panic!("expected Domain, got {other:?}"),
        }
    }

    #[test]
    fn supports_reports_registered_methods() {
        let ops = table();
        assert!(ops.supports("bump"));
        assert!(!ops.supports("volumes"));
        assert_eq!(ops.len(), 3);
        assert!(ops.methods().any(|m| m == "grow"));
    }

    #[test]
    fn raw_registration_sees_the_mapping_as_is() {
        let mut ops: OpTable<Counter> = OpTable::new();
        ops.register_raw("inspect", |_b, params| {
            Ok(json!({"had_params": params.is_some()}))
        });
        let mut counter = Counter::default();
        assert_eq!(
            ops.invoke(&mut counter, "inspect", None).unwrap(),
            json!({"had_params": false})
        );
    }
}
