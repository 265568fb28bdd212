//! Structured WQL queries and transport calls.

use core::fmt;
use std::collections::BTreeMap;

use super::value::{Value, WmiObject};
use crate::error::TransportError;

/// A WQL query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// `SELECT * FROM class [WHERE a = x AND b = y]`
    Select {
        class: String,
        filters: Vec<(String, Value)>,
    },
    /// `ASSOCIATORS OF {path} WHERE [AssocClass=a] ResultClass=r`
    Associators {
        of: String,
        assoc_class: Option<String>,
        result_class: String,
    },
    /// `REFERENCES OF {path} WHERE ResultClass=r`
    References { of: String, result_class: String },
}

impl Query {
    pub fn select(class: impl Into<String>) -> Self {
        Query::Select {
            class: class.into(),
            filters: Vec::new(),
        }
    }

    /// Add an equality filter. No effect on non-`SELECT` queries.
    pub fn filter(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Query::Select { ref mut filters, .. } = self {
            filters.push((property.into(), value.into()));
        }
        self
    }

    pub fn associators(of: impl Into<String>, result_class: impl Into<String>) -> Self {
        Query::Associators {
            of: of.into(),
            assoc_class: None,
            result_class: result_class.into(),
        }
    }

    /// Restrict an `ASSOCIATORS OF` query to one association class.
    pub fn via(mut self, assoc: impl Into<String>) -> Self {
        if let Query::Associators {
            ref mut assoc_class,
            ..
        } = self
        {
            *assoc_class = Some(assoc.into());
        }
        self
    }

    pub fn references(of: impl Into<String>, result_class: impl Into<String>) -> Self {
        Query::References {
            of: of.into(),
            result_class: result_class.into(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Select { class, filters } => {
                write!(f, "SELECT * FROM {}", class)?;
                for (i, (property, value)) in filters.iter().enumerate() {
                    let joiner = if i == 0 { "WHERE" } else { "AND" };
                    write!(f, " {} {} = {}", joiner, property, value.to_wql())?;
                }
                Ok(())
            }
            Query::Associators {
                of,
                assoc_class,
                result_class,
            } => {
                write!(f, "ASSOCIATORS OF {{{}}} WHERE", of)?;
                if let Some(assoc) = assoc_class {
                    write!(f, " AssocClass={}", assoc)?;
                }
                write!(f, " ResultClass={}", result_class)
            }
            Query::References { of, result_class } => {
                write!(f, "REFERENCES OF {{{}}} WHERE ResultClass={}", of, result_class)
            }
        }
    }
}

/// A provider method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    /// Object path the method is invoked on.
    pub target: String,
    /// Class that declares the method (for in-parameter lookup).
    pub class: String,
    pub method: String,
    pub args: BTreeMap<String, Value>,
}

impl MethodCall {
    pub fn new(target: impl Into<String>, class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            class: class.into(),
            method: method.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

/// One round trip to the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query(Query),
    Get { path: String },
    Exec(MethodCall),
}

impl Call {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Call::Query(q) => q.to_string(),
            Call::Get { path } => format!("GET {}", path),
            Call::Exec(m) => format!("{}.{}", m.class, m.method),
        }
    }
}

/// Provider answer to a [`Call`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Objects(Vec<WmiObject>),
    Object(WmiObject),
}

impl Reply {
    pub fn into_objects(self) -> Vec<WmiObject> {
        match self {
            Reply::Objects(objects) => objects,
            Reply::Object(object) => vec![object],
        }
    }

    pub fn into_object(self) -> Result<WmiObject, TransportError> {
        match self {
            Reply::Object(object) => Ok(object),
            Reply::Objects(mut objects) if objects.len() == 1 => Ok(objects.remove(0)),
            Reply::Objects(objects) => Err(TransportError::malformed(format!(
                "expected one object, provider returned {}",
                objects.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_renders_filters() {
        let q = Query::select("Msvm_ComputerSystem")
            .filter("Caption", "Virtual Machine")
            .filter("ElementName", "web'01");
        assert_eq!(
            q.to_string(),
            "SELECT * FROM Msvm_ComputerSystem WHERE Caption = 'Virtual Machine' AND ElementName = 'web\\'01'"
        );
    }

    #[test]
    fn associators_render_like_provider_syntax() {
        let q = Query::associators("Msvm_ResourcePool.InstanceID=\"x\"", "Msvm_AllocationCapabilities")
            .via("Msvm_ElementCapabilities");
        assert_eq!(
            q.to_string(),
            "ASSOCIATORS OF {Msvm_ResourcePool.InstanceID=\"x\"} WHERE AssocClass=Msvm_ElementCapabilities ResultClass=Msvm_AllocationCapabilities"
        );

        let q = Query::references("caps", "Msvm_SettingsDefineCapabilities");
        assert_eq!(
            q.to_string(),
            "REFERENCES OF {caps} WHERE ResultClass=Msvm_SettingsDefineCapabilities"
        );
    }

    #[test]
    fn reply_into_object_rejects_many() {
        let reply = Reply::Objects(vec![WmiObject::new("A"), WmiObject::new("B")]);
        assert!(reply.into_object().is_err());
        let reply = Reply::Objects(vec![WmiObject::new("A")]);
        assert_eq!(reply.into_object().unwrap().class(), "A");
    }
}
