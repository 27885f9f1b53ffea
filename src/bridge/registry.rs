use std::collections::HashMap;

use super::scope::ScopeId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FunctionKey {
    name: String,
    scope: ScopeId,
}

/// Functions an agent can be asked to run, keyed by `(name, scope)`.
#[derive(Debug)]
pub struct FunctionRegistry<F> {
    functions: HashMap<FunctionKey, F>,
}

impl<F> Default for FunctionRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> FunctionRegistry<F> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Install `function` under `(name, scope)`.
    ///
    /// Without `replace` an existing entry wins and the new function is handed back.
    /// With `replace` the previous function, if any, is returned.
    pub fn insert(
        &mut self,
        name: &str,
        scope: ScopeId,
        function: F,
        replace: bool,
    ) -> Result<Option<F>, F> {
        let key = FunctionKey {
            name: name.to_string(),
            scope,
        };
        if !replace && self.functions.contains_key(&key) {
            return Err(function);
        }
        Ok(self.functions.insert(key, function))
    }

    pub fn remove(&mut self, name: &str, scope: ScopeId) -> Option<F> {
        self.functions.remove(&FunctionKey {
            name: name.to_string(),
            scope,
        })
    }

    pub fn get(&self, name: &str, scope: ScopeId) -> Option<&F> {
        self.functions.get(&FunctionKey {
            name: name.to_string(),
            scope,
        })
    }

    /// Look up `name` for `scope`, falling back to the global scope.
    pub fn resolve(&self, name: &str, scope: ScopeId) -> Option<&F> {
        self.get(name, scope).or_else(|| {
            if scope.is_global() {
                None
            } else {
                self.get(name, ScopeId::GLOBAL)
            }
        })
    }

    /// Drop every function registered for `scope`. Global entries always survive.
    pub fn release_scope(&mut self, scope: ScopeId) -> Vec<F> {
        if scope.is_global() {
            return Vec::new();
        }
        let doomed: Vec<FunctionKey> = self
            .functions
            .keys()
            .filter(|key| key.scope == scope)
            .cloned()
            .collect();
        doomed
            .into_iter()
            .filter_map(|key| self.functions.remove(&key))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<F> {
        self.functions.drain().map(|(_, function)| function).collect()
    }

    pub fn names_in(&self, scope: ScopeId) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .filter(|key| key.scope == scope)
            .map(|key| key.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
