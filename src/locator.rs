//! Scoped dependency registry.
//!
//! A stack of named scopes, each mapping a type token to a zero-argument
//! factory. Lookup walks the stack top-down; the first match wins. The
//! locator is a convenience layer at the outermost boundary — components
//! themselves take their collaborators as constructor parameters.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;

type Factory = Box<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;
type PopHook = Box<dyn FnOnce() + Send>;

/// Name of the bottom scope; it cannot be popped.
pub const DEFAULT_SCOPE: &str = "default";

struct Scope {
    name: String,
    factories: HashMap<TypeId, Factory>,
    on_pop: Option<PopHook>,
}

impl Scope {
    fn named(name: impl Into<String>, on_pop: Option<PopHook>) -> Self {
        Self {
            name: name.into(),
            factories: HashMap::new(),
            on_pop,
        }
    }
}

pub struct ServiceLocator {
    scopes: Mutex<Vec<Scope>>,
}

impl Default for ServiceLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(vec![Scope::named(DEFAULT_SCOPE, None)]),
        }
    }

    /// Register a factory in the current (top) scope.
    pub fn register<T, F>(&self, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut scopes = self.scopes.lock();
        let top = scopes.last_mut().unwrap();
        debug_assert!(
            !top.factories.contains_key(&TypeId::of::<T>()),
            "type already registered in scope '{}'",
            top.name
        );
        top.factories
            .insert(TypeId::of::<T>(), Box::new(move || Box::new(factory())));
    }

    /// Walk the scope stack top-down and build the first matching value.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Option<T> {
        let scopes = self.scopes.lock();
        for scope in scopes.iter().rev() {
            if let Some(factory) = scope.factories.get(&TypeId::of::<T>()) {
                return factory().downcast::<T>().ok().map(|b| *b);
            }
        }
        None
    }

    /// Remove the token from every scope.
    pub fn unregister<T: Any + Send + Sync>(&self) {
        let mut scopes = self.scopes.lock();
        for scope in scopes.iter_mut() {
            scope.factories.remove(&TypeId::of::<T>());
        }
    }

    pub fn push_scope(&self, name: impl Into<String>, on_pop: Option<PopHook>) {
        self.scopes.lock().push(Scope::named(name, on_pop));
    }

    /// Pop the top scope and run its hook. The default scope stays.
    pub fn pop_scope(&self) -> bool {
        let popped = {
            let mut scopes = self.scopes.lock();
            if scopes.len() <= 1 {
                return false;
            }
            scopes.pop()
        };
        if let Some(mut scope) = popped {
            if let Some(hook) = scope.on_pop.take() {
                hook();
            }
            return true;
        }
        false
    }

    pub fn scope_names(&self) -> Vec<String> {
        self.scopes.lock().iter().map(|s| s.name.clone()).collect()
    }
}
