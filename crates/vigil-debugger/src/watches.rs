//! Variable watches.
//!
//! A watch is a plain identifier or a dotted field chain (`point.x`,
//! `this.buffer.len`) evaluated against the current thread's top frame
//! every time the session stops. No expression language beyond that; the
//! legacy protocol never supported one either.

use vigil_backend::{BackendError, FieldValue, ObjectId, ThreadId, Value};

use crate::error::{DebugError, DebugResult};
use crate::gateway::RequestGateway;

pub type WatchId = u32;

/// Where the resolved value lives, kept so edits can be written back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchTarget {
    Local { name: String },
    Field { object: ObjectId, field: String },
}

/// The outcome of one evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchValue {
    pub type_name: String,
    pub value: Value,
    pub rendered: String,
    /// Child fields, cached by the remote object's identity: kept across
    /// refreshes while the watch resolves to the same object, refetched
    /// when the identity changes.
    pub fields: Vec<FieldValue>,
}

#[derive(Clone, Debug)]
pub struct Watch {
    expression: String,
    /// Hidden watches evaluate like visible ones but views skip them; used
    /// for internal probes like the exception object of a stop.
    hidden: bool,
    target: Option<WatchTarget>,
    value: Option<WatchValue>,
}

impl Watch {
    pub fn new(expression: impl Into<String>, hidden: bool) -> DebugResult<Self> {
        let expression = expression.into();
        if !is_watchable(&expression) {
            return Err(DebugError::InvalidRequest(format!(
                "`{expression}` is not a variable or field chain"
            )));
        }
        Ok(Self {
            expression,
            hidden,
            target: None,
            value: None,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// `None` while unresolved (not stopped, or the name is out of scope).
    pub fn value(&self) -> Option<&WatchValue> {
        self.value.as_ref()
    }

    pub fn invalidate(&mut self) {
        self.target = None;
        self.value = None;
    }

    /// Re-evaluate against `thread`'s frame `frame`. Scope misses clear the
    /// cached value instead of failing; the watch stays registered and is
    /// retried at the next stop.
    pub fn refresh(
        &mut self,
        gateway: &RequestGateway,
        thread: ThreadId,
        frame: usize,
    ) -> DebugResult<()> {
        let expression = self.expression.clone();
        let cached_identity = self.value.as_ref().and_then(|v| v.value.object_id());
        let resolved = gateway.run_blocking(move |backend| {
            let mut segments = expression.split('.');
            // `is_watchable` guarantees at least one segment.
            let head = segments.next().unwrap_or_default().to_string();

            let locals = match backend.frame_locals(thread, frame) {
                Ok(locals) => locals,
                // No such frame right now: out of scope, not an error.
                Err(BackendError::InvalidFrame { .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            let Some(local) = locals.into_iter().find(|v| v.name == head) else {
                return Ok(None);
            };
            let mut target = WatchTarget::Local { name: head };
            let mut type_name = local.type_name;
            let mut value = local.value;

            for segment in segments {
                let Some(object) = value.object_id() else {
                    return Ok(None);
                };
                let fields = backend.object_fields(object)?;
                let Some(field) = fields.into_iter().find(|f| f.name == segment) else {
                    return Ok(None);
                };
                target = WatchTarget::Field {
                    object,
                    field: segment.to_string(),
                };
                type_name = field.type_name;
                value = field.value;
            }

            // `None` fields mean the watch still resolves to the cached
            // object; its field list is reused outside the job.
            let fields = match value.object_id() {
                Some(object) if cached_identity == Some(object) => None,
                Some(object) => Some(backend.object_fields(object)?),
                None => Some(Vec::new()),
            };
            Ok(Some((target, type_name, value, fields)))
        })?;

        match resolved {
            Some((target, type_name, value, fields)) => {
                let fields = match fields {
                    Some(fields) => fields,
                    None => self.value.take().map(|v| v.fields).unwrap_or_default(),
                };
                let rendered = render_value(&value);
                self.target = Some(target);
                self.value = Some(WatchValue {
                    type_name,
                    value,
                    rendered,
                    fields,
                });
            }
            None => self.invalidate(),
        }
        Ok(())
    }

    /// Parse `text` against the watched value's primitive type and write it
    /// back to the debuggee.
    pub fn set_as_text(
        &mut self,
        gateway: &RequestGateway,
        thread: ThreadId,
        frame: usize,
        text: &str,
    ) -> DebugResult<()> {
        let Some(current) = self.value.as_ref() else {
            return Err(DebugError::InvalidRequest(format!(
                "`{}` is not resolved",
                self.expression
            )));
        };
        let Some(target) = self.target.clone() else {
            return Err(DebugError::InvalidRequest(format!(
                "`{}` is not resolved",
                self.expression
            )));
        };

        let new_value = parse_value(&current.value, text)?;
        let written = new_value.clone();
        gateway.run_blocking(move |backend| match target {
            WatchTarget::Local { name } => backend.set_local(thread, frame, &name, written),
            WatchTarget::Field { object, field } => backend.set_field(object, &field, written),
        })?;

        if let Some(value) = self.value.as_mut() {
            value.rendered = render_value(&new_value);
            value.value = new_value;
        }
        Ok(())
    }
}

/// An identifier, or a dot-separated chain of identifiers.
fn is_watchable(expression: &str) -> bool {
    !expression.is_empty()
        && expression.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
                _ => return false,
            }
            chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        })
}

/// Render for display. Floats use the shortest round-trip form, chars are
/// quoted, object references show runtime type and id.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Void => "void".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Byte(v) => v.to_string(),
        Value::Short(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Char(c) => format!("'{c}'"),
        Value::Object(obj) => format!("{}@{}", obj.runtime_type, obj.id),
    }
}

/// Parse user text into a value of the same kind as `current`.
pub fn parse_value(current: &Value, text: &str) -> DebugResult<Value> {
    let text = text.trim();
    let invalid = || {
        DebugError::InvalidValueFormat(format!(
            "`{text}` is not a valid {}",
            current.type_name()
        ))
    };
    match current {
        Value::Boolean(_) => match text {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err(invalid()),
        },
        Value::Byte(_) => text.parse().map(Value::Byte).map_err(|_| invalid()),
        Value::Short(_) => text.parse().map(Value::Short).map_err(|_| invalid()),
        Value::Int(_) => text.parse().map(Value::Int).map_err(|_| invalid()),
        Value::Long(_) => text.parse().map(Value::Long).map_err(|_| invalid()),
        Value::Float(_) => text.parse().map(Value::Float).map_err(|_| invalid()),
        Value::Double(_) => text.parse().map(Value::Double).map_err(|_| invalid()),
        Value::Char(_) => {
            let unquoted = text
                .strip_prefix('\'')
                .and_then(|t| t.strip_suffix('\''))
                .unwrap_or(text);
            let mut chars = unquoted.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Char(c)),
                _ => Err(invalid()),
            }
        }
        Value::Null | Value::Void | Value::Object(_) => Err(DebugError::InvalidValueFormat(
            format!("values of type {} cannot be edited", current.type_name()),
        )),
    }
}
