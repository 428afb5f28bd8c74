//! Proxied storage calls: the method names accepted by the `emit` and `data`
//! routes and the typed decoding of their positional arguments.

use crate::document::{Document, FindOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which route a proxied call arrives through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only calls (`findOne`, `find`, `count`).
    Data,
    /// Mutating calls that publish events.
    Emit,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Emit => "emit",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage methods reachable through the HTTP proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProxyMethod {
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    Remove,
    FindOne,
    Find,
    Count,
}

impl ProxyMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsertOne => "insertOne",
            Self::InsertMany => "insertMany",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::Remove => "remove",
            Self::FindOne => "findOne",
            Self::Find => "find",
            Self::Count => "count",
        }
    }

    /// The route a method belongs to.
    pub fn mode(self) -> AccessMode {
        match self {
            Self::FindOne | Self::Find | Self::Count => AccessMode::Data,
            _ => AccessMode::Emit,
        }
    }
}

impl fmt::Display for ProxyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMethod {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "insertOne" => Self::InsertOne,
            "insertMany" => Self::InsertMany,
            "updateOne" => Self::UpdateOne,
            "updateMany" => Self::UpdateMany,
            "remove" => Self::Remove,
            "findOne" => Self::FindOne,
            "find" => Self::Find,
            "count" => Self::Count,
            other => return Err(CallError::UnknownMethod(other.to_string())),
        })
    }
}

/// Errors raised while decoding proxied call arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("{0} method unknown")]
    UnknownMethod(String),
    #[error("Arguments cannot be empty")]
    EmptyArguments,
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
}

/// A decoded proxied call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyCall {
    InsertOne {
        collection: String,
        document: Document,
        options: Option<Value>,
    },
    InsertMany {
        collection: String,
        documents: Vec<Document>,
        options: Option<Value>,
    },
    UpdateOne {
        collection: String,
        filter: Value,
        update: Value,
        options: Option<Value>,
    },
    UpdateMany {
        collection: String,
        filter: Value,
        update: Value,
        options: Option<Value>,
    },
    Remove {
        collection: String,
        filter: Value,
        options: Option<Value>,
    },
    FindOne {
        collection: String,
        filter: Value,
        projection: Option<Value>,
    },
    Find {
        collection: String,
        filter: Value,
        projection: Option<Value>,
        options: FindOptions,
    },
    Count {
        collection: String,
        filter: Value,
    },
}

fn present(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index).filter(|v| !v.is_null())
}

fn collection_arg(args: &[Value]) -> Result<String, CallError> {
    match args.first() {
        Some(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(_) => Err(CallError::InvalidArgument {
            name: "collection",
            reason: "must be a non-empty string".to_string(),
        }),
        None => Err(CallError::MissingArgument("collection")),
    }
}

fn object_arg(args: &[Value], index: usize, name: &'static str) -> Result<Document, CallError> {
    match args.get(index) {
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(CallError::InvalidArgument {
            name,
            reason: "must be an object".to_string(),
        }),
        None => Err(CallError::MissingArgument(name)),
    }
}

fn filter_arg(args: &[Value], index: usize) -> Value {
    present(args, index)
        .cloned()
        .unwrap_or_else(|| Value::Object(Document::new()))
}

impl ProxyCall {
    /// Decodes the positional `args` of a proxied call.
    pub fn parse(method: ProxyMethod, args: &[Value]) -> Result<Self, CallError> {
        if args.is_empty() {
            return Err(CallError::EmptyArguments);
        }
        let collection = collection_arg(args)?;
        Ok(match method {
            ProxyMethod::InsertOne => Self::InsertOne {
                collection,
                document: object_arg(args, 1, "document")?,
                options: present(args, 2).cloned(),
            },
            ProxyMethod::InsertMany => {
                let documents = match args.get(1) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| match item {
                            Value::Object(map) => Ok(map.clone()),
                            _ => Err(CallError::InvalidArgument {
                                name: "documents",
                                reason: "every document must be an object".to_string(),
                            }),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => {
                        return Err(CallError::InvalidArgument {
                            name: "documents",
                            reason: "must be an array".to_string(),
                        })
                    }
                    None => return Err(CallError::MissingArgument("documents")),
                };
                Self::InsertMany {
                    collection,
                    documents,
                    options: present(args, 2).cloned(),
                }
            }
            ProxyMethod::UpdateOne | ProxyMethod::UpdateMany => {
                let filter = filter_arg(args, 1);
                let update = Value::Object(object_arg(args, 2, "update")?);
                let options = present(args, 3).cloned();
                if method == ProxyMethod::UpdateOne {
                    Self::UpdateOne {
                        collection,
                        filter,
                        update,
                        options,
                    }
                } else {
                    Self::UpdateMany {
                        collection,
                        filter,
                        update,
                        options,
                    }
                }
            }
            ProxyMethod::Remove => Self::Remove {
                collection,
                filter: filter_arg(args, 1),
                options: present(args, 2).cloned(),
            },
            ProxyMethod::FindOne => Self::FindOne {
                collection,
                filter: filter_arg(args, 1),
                projection: present(args, 2).cloned(),
            },
            ProxyMethod::Find => Self::Find {
                collection,
                filter: filter_arg(args, 1),
                projection: present(args, 2).cloned(),
                options: match present(args, 3) {
                    Some(options) => serde_json::from_value(options.clone()).map_err(|e| {
                        CallError::InvalidArgument {
                            name: "options",
                            reason: e.to_string(),
                        }
                    })?,
                    None => FindOptions::default(),
                },
            },
            ProxyMethod::Count => Self::Count {
                collection,
                filter: filter_arg(args, 1),
            },
        })
    }

    pub fn method(&self) -> ProxyMethod {
        match self {
            Self::InsertOne { .. } => ProxyMethod::InsertOne,
            Self::InsertMany { .. } => ProxyMethod::InsertMany,
            Self::UpdateOne { .. } => ProxyMethod::UpdateOne,
            Self::UpdateMany { .. } => ProxyMethod::UpdateMany,
            Self::Remove { .. } => ProxyMethod::Remove,
            Self::FindOne { .. } => ProxyMethod::FindOne,
            Self::Find { .. } => ProxyMethod::Find,
            Self::Count { .. } => ProxyMethod::Count,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::InsertOne { collection, .. }
            | Self::InsertMany { collection, .. }
            | Self::UpdateOne { collection, .. }
            | Self::UpdateMany { collection, .. }
            | Self::Remove { collection, .. }
            | Self::FindOne { collection, .. }
            | Self::Find { collection, .. }
            | Self::Count { collection, .. } => collection,
        }
    }

    /// Encodes the call back into positional arguments.
    pub fn to_args(&self) -> Vec<Value> {
        let name = Value::String(self.collection().to_string());
        let optional = |v: &Option<Value>| v.clone().unwrap_or(Value::Null);
        let mut args = match self {
            Self::InsertOne {
                document, options, ..
            } => vec![name, Value::Object(document.clone()), optional(options)],
            Self::InsertMany {
                documents, options, ..
            } => vec![
                name,
                Value::Array(documents.iter().cloned().map(Value::Object).collect()),
                optional(options),
            ],
            Self::UpdateOne {
                filter,
                update,
                options,
                ..
            }
            | Self::UpdateMany {
                filter,
                update,
                options,
                ..
            } => vec![name, filter.clone(), update.clone(), optional(options)],
            Self::Remove {
                filter, options, ..
            } => vec![name, filter.clone(), optional(options)],
            Self::FindOne {
                filter, projection, ..
            } => vec![name, filter.clone(), optional(projection)],
            Self::Find {
                filter,
                projection,
                options,
                ..
            } => vec![
                name,
                filter.clone(),
                optional(projection),
                serde_json::to_value(options).unwrap_or(Value::Null),
            ],
            Self::Count { filter, .. } => vec![name, filter.clone()],
        };
        while args.len() > 2 && args.last().is_some_and(Value::is_null) {
            args.pop();
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_names_and_modes() {
        for method in [
            ProxyMethod::InsertOne,
            ProxyMethod::InsertMany,
            ProxyMethod::UpdateOne,
            ProxyMethod::UpdateMany,
            ProxyMethod::Remove,
        ] {
            assert_eq!(method.mode(), AccessMode::Emit);
            assert_eq!(method.as_str().parse::<ProxyMethod>(), Ok(method));
        }
        assert_eq!(ProxyMethod::Count.mode(), AccessMode::Data);
        assert_eq!(
            "drop".parse::<ProxyMethod>(),
            Err(CallError::UnknownMethod("drop".to_string()))
        );
    }

    #[test]
    fn parse_update_defaults_filter() {
        let call = ProxyCall::parse(
            ProxyMethod::UpdateMany,
            &[json!("t"), Value::Null, json!({"$set": {"a": 1}})],
        )
        .unwrap();
        assert_eq!(
            call,
            ProxyCall::UpdateMany {
                collection: "t".to_string(),
                filter: json!({}),
                update: json!({"$set": {"a": 1}}),
                options: None,
            }
        );
    }

    #[test]
    fn parse_rejects_bad_arguments() {
        assert_eq!(
            ProxyCall::parse(ProxyMethod::Count, &[]),
            Err(CallError::EmptyArguments)
        );
        assert_eq!(
            ProxyCall::parse(ProxyMethod::InsertOne, &[json!("t")]),
            Err(CallError::MissingArgument("document"))
        );
        assert!(matches!(
            ProxyCall::parse(ProxyMethod::InsertMany, &[json!("t"), json!([1])]),
            Err(CallError::InvalidArgument { name: "documents", .. })
        ));
        assert!(matches!(
            ProxyCall::parse(ProxyMethod::Find, &[json!(3)]),
            Err(CallError::InvalidArgument { name: "collection", .. })
        ));
    }

    #[test]
    fn find_options_decode() {
        let call = ProxyCall::parse(
            ProxyMethod::Find,
            &[json!("t"), json!({}), Value::Null, json!({"limit": 2})],
        )
        .unwrap();
        let ProxyCall::Find { options, .. } = &call else {
            panic!("expected find");
        };
        assert_eq!(options.limit, Some(2));
        assert_eq!(
            call.to_args(),
            vec![json!("t"), json!({}), Value::Null, json!({"limit": 2})]
        );
    }
}
