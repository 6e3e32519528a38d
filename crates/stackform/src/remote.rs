//! Tokens.
//!
//! A token is a value that only becomes known once an upstream construct has
//! been created or loaded, eg. the generated name of a bucket. Tokens are
//! placed into downstream definitions and resolved lazily during apply.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use snafu::OptionExt;

use crate::{
    Action, Construct, Dependencies, DowncastSnafu, Error, HasDependencies,
    RemoteUnresolvedSnafu, Resource,
};

type MapFn<X> = Arc<dyn Fn(&Arc<dyn Any>) -> Result<X, Error>>;

#[derive(Clone)]
enum RemoteInner<X> {
    /// Read back from a state file, the value is whatever was last applied.
    Stored { token: String, value: Option<X> },
    /// Live mapping over an upstream construct's output cell.
    Live {
        token: String,
        map: MapFn<X>,
        // RemoteVar<T::Output>
        var: Arc<dyn Any>,
    },
}

impl<X> RemoteInner<X> {
    fn token(&self) -> &str {
        match self {
            RemoteInner::Stored { token, .. } => token,
            RemoteInner::Live { token, .. } => token,
        }
    }
}

/// A token on the output of another construct.
#[derive(Clone)]
pub struct Remote<X> {
    inner: RemoteInner<X>,
}

impl<X: Clone + core::fmt::Debug + 'static> std::fmt::Debug for Remote<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("token", &self.token())
            .field("value", &self.get().ok())
            .finish()
    }
}

/// Two tokens are equal only when both resolve to the same value.
impl<X: Clone + core::fmt::Debug + PartialEq + 'static> PartialEq for Remote<X> {
    fn eq(&self, other: &Self) -> bool {
        match (self.get(), other.get()) {
            (Ok(here), Ok(there)) => here == there,
            _ => false,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TokenProxy<T> {
    token: String,
    value: Option<T>,
}

impl<X: serde::Serialize + Clone + core::fmt::Debug + 'static> serde::Serialize for Remote<X> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        TokenProxy {
            token: self.token().to_owned(),
            value: self.get().ok(),
        }
        .serialize(serializer)
    }
}

impl<'de, X: serde::Deserialize<'de>> serde::Deserialize<'de> for Remote<X> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let TokenProxy { token, value } = TokenProxy::<X>::deserialize(deserializer)?;
        Ok(Remote {
            inner: RemoteInner::Stored { token, value },
        })
    }
}

impl<X: Clone + core::fmt::Debug + 'static> Remote<X> {
    pub(crate) fn new<T: Resource>(
        construct: &Construct<T, T::Output>,
        map: impl Fn(&T::Output) -> X + 'static,
    ) -> Self {
        let token = construct.id().to_owned();
        log::trace!("creating token on '{token}'");
        Self {
            inner: RemoteInner::Live {
                map: Arc::new({
                    let token = token.clone();
                    move |any: &Arc<dyn Any>| {
                        let var = any
                            .downcast_ref::<RemoteVar<T::Output>>()
                            .context(DowncastSnafu { id: token.clone() })?;
                        let output = var.get().context(RemoteUnresolvedSnafu {
                            ty: core::any::type_name::<X>(),
                            depends_on: token.clone(),
                        })?;
                        Ok(map(&output))
                    }
                }),
                token,
                var: Arc::new(construct.remote_var.clone()),
            },
        }
    }

    /// The id of the construct this token depends on.
    pub fn token(&self) -> &str {
        self.inner.token()
    }

    /// Resolve the token.
    ///
    /// ## Errors
    /// Errs if the upstream construct has not been created or loaded yet.
    pub fn get(&self) -> Result<X, Error> {
        match &self.inner {
            RemoteInner::Stored { token, value } => {
                log::trace!("token on '{token}' returning stored value: {value:?}");
                value.clone().context(RemoteUnresolvedSnafu {
                    ty: core::any::type_name::<X>(),
                    depends_on: token.clone(),
                })
            }
            RemoteInner::Live { map, var, .. } => map(var),
        }
    }

    pub fn map<Y>(&self, f: impl Fn(X) -> Y + 'static) -> Remote<Y> {
        match &self.inner {
            RemoteInner::Stored { token, value } => Remote {
                inner: RemoteInner::Stored {
                    token: token.clone(),
                    value: value.clone().map(f),
                },
            },
            RemoteInner::Live { token, map, var } => Remote {
                inner: RemoteInner::Live {
                    token: token.clone(),
                    var: var.clone(),
                    map: Arc::new({
                        let map = map.clone();
                        move |any: &Arc<dyn Any>| map(any).map(&f)
                    }),
                },
            },
        }
    }
}

impl<X> HasDependencies for Remote<X> {
    fn dependencies(&self) -> Dependencies {
        Dependencies::new(self.inner.token())
    }
}

/// Shared output cell of a construct.
#[derive(Debug)]
pub(crate) struct RemoteVar<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> Default for RemoteVar<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T> Clone for RemoteVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> RemoteVar<T> {
    pub fn get(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: Option<T>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

pub(crate) struct Var {
    /// Resource key in the apply graph.
    pub(crate) key: usize,
    pub(crate) ty: &'static str,
    pub(crate) kind: String,
    pub(crate) action: Action,
}

/// Output cells of every construct declared in the current run.
#[derive(Default)]
pub(crate) struct Remotes {
    vars: HashMap<String, Var>,
    /// Declaration order.
    order: Vec<String>,
}

impl core::fmt::Display for Remotes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (id, var) in self.iter() {
            writeln!(
                f,
                "id:'{id}' key:{} kind:{} output:{}",
                var.key, var.kind, var.ty
            )?;
        }
        Ok(())
    }
}

impl Remotes {
    /// Declares a new output cell, returning it and its graph key.
    ///
    /// ## Errors
    /// Errs if a construct with the same id was already declared.
    pub fn declare<T: Any>(
        &mut self,
        id: &str,
        kind: impl Into<String>,
        action: Action,
    ) -> Result<(RemoteVar<T>, usize), Error> {
        snafu::ensure!(
            !self.vars.contains_key(id),
            crate::DuplicateIdSnafu { id: id.to_owned() }
        );
        let key = self.order.len();
        log::trace!(
            "declaring '{id}' as key {key} of {}",
            core::any::type_name::<T>()
        );
        let var = RemoteVar::<T>::default();
        self.vars.insert(
            id.to_owned(),
            Var {
                key,
                ty: core::any::type_name::<T>(),
                kind: kind.into(),
                action,
            },
        );
        self.order.push(id.to_owned());
        Ok((var, key))
    }

    /// Returns the id of a construct by graph key.
    pub fn get_id_by_key(&self, key: usize) -> Option<String> {
        self.order.get(key).cloned()
    }

    pub fn get(&self, id: &str) -> Option<&Var> {
        self.vars.get(id)
    }

    pub fn declared_ids(&self) -> HashSet<String> {
        self.vars.keys().cloned().collect()
    }

    /// Iterate over declared constructs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Var)> {
        self.order
            .iter()
            .filter_map(|id| self.vars.get(id).map(|var| (id, var)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stored_token_resolves_to_last_applied_value() {
        let json = serde_json::json!({
            "token": "MyFirstBucket",
            "value": "assignment2-myfirstbucket-0a1b2c3d4e5f"
        });
        let remote: Remote<String> = serde_json::from_value(json.clone()).unwrap();
        assert_eq!("MyFirstBucket", remote.token());
        assert_eq!(
            "assignment2-myfirstbucket-0a1b2c3d4e5f",
            remote.get().unwrap()
        );
        assert_eq!(json, serde_json::to_value(&remote).unwrap());
        assert_eq!(
            vec!["MyFirstBucket".to_owned()],
            remote.dependencies().into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn unresolved_token_errs_and_is_never_equal() {
        let remote: Remote<String> =
            serde_json::from_value(serde_json::json!({"token": "MyTable", "value": null}))
                .unwrap();
        assert!(matches!(
            remote.get(),
            Err(Error::RemoteUnresolved { depends_on, .. }) if depends_on == "MyTable"
        ));
        assert_ne!(remote, remote.clone());

        let arn = remote.map(|name| format!("arn:aws:dynamodb:::table/{name}"));
        assert_eq!("MyTable", arn.token());
        assert!(arn.get().is_err());
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let mut remotes = Remotes::default();
        let (_, key) = remotes
            .declare::<String>("MyLambda", "test", Action::Create)
            .unwrap();
        assert_eq!(0, key);
        assert!(matches!(
            remotes.declare::<String>("MyLambda", "test", Action::Create),
            Err(Error::DuplicateId { .. })
        ));
        assert_eq!(Some("MyLambda".to_owned()), remotes.get_id_by_key(0));
    }
}
