// File: src/store.rs
//
// Evaluation scopes. A Store holds the ordered name and pattern tables
// that LOAD_NAME/STORE_NAME/PUSH_FN arguments index into, the data
// bindings themselves, and the nested function registry. Callee frames
// share their caller's Store by reference; the `local` flag on a
// binding records whether it was declared here or absorbed from an
// import or an enclosing scope.

use crate::value::{Function, MapData, OnCall, PatternItem, Value};
use std::rc::Rc;

/// One name binding
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub value: Value,
    pub local: bool,
}

/// A scope: names, patterns, data, and functions
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub names: Vec<String>,
    pub patterns: Vec<String>,
    pub data: Vec<Binding>,
    pub functions: FunctionStore,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name`, returning its index in the name table. Redefining
    /// updates the existing binding in place.
    pub fn define(&mut self, name: &str, value: Value, local: bool) -> u16 {
        let index = match self.names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_string());
                self.names.len() - 1
            }
        };

        match self.data.iter_mut().find(|binding| binding.name == name) {
            Some(binding) => {
                binding.value = value;
                binding.local = local;
            }
            None => {
                self.data.push(Binding { name: name.to_string(), value, local });
            }
        }

        index as u16
    }

    /// Look up a binding's value by name
    pub fn get_name(&self, name: &str) -> Option<Value> {
        self.data.iter().find(|binding| binding.name == name).map(|binding| binding.value.clone())
    }

    /// The name string at a given name-table index
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    /// The pattern string at a given pattern-table index
    pub fn pattern_at(&self, index: usize) -> Option<&str> {
        self.patterns.get(index).map(|s| s.as_str())
    }

    /// Merge an executed package's store into this one under a single
    /// module binding; returns the binding name and the module value.
    ///
    /// The module name is the `title` entry of the package's `_module`
    /// map when one is defined, otherwise `fallback`. The merged value
    /// is a Map holding every locally-defined binding of the package
    /// (absorbed bindings are skipped), with the package's functions
    /// attached under the synthetic `_methods` key for qualified-call
    /// dispatch.
    pub fn import_module(&mut self, other: &Store, fallback: &str) -> (String, Value) {
        let mut module = MapData::new();
        let mut module_name = fallback.to_string();

        if let Some(Value::Map(meta)) = other.get_name("_module") {
            if let Some(title) = meta.borrow().get_str("title") {
                module_name = title.to_string();
                module = meta.borrow().clone();
            }
        }

        // builtins are registered into every store and are globally
        // reachable; only the package's own functions become methods
        let functions: Vec<Value> = other
            .functions
            .functions
            .iter()
            .filter(|f| !matches!(f.on_call, Some(OnCall::Builtin(_))))
            .map(|f| Value::Function(Rc::clone(f)))
            .collect();

        let methods = match module.get_str("_methods") {
            Some(Value::Array(old)) => {
                let mut all = functions;
                all.extend(old.borrow().iter().cloned());
                all
            }
            _ => functions,
        };

        module.set(Value::string("_methods"), Value::array(methods));

        for binding in &other.data {
            if binding.name == "_module" || !binding.local {
                continue;
            }

            module.set(Value::string(binding.name.as_str()), binding.value.clone());
        }

        let value = Value::map(module);
        self.define(&module_name, value.clone(), false);

        (module_name, value)
    }
}

/// The pattern-keyed function registry of a scope
#[derive(Debug, Clone, Default)]
pub struct FunctionStore {
    pub functions: Vec<Rc<Function>>,
}

impl FunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. A function with an equal pattern replaces
    /// the existing one; duplicates by pattern are not allowed.
    pub fn define(&mut self, function: Rc<Function>) {
        if let Some(existing) =
            self.functions.iter_mut().find(|f| f.same_pattern(&function))
        {
            *existing = function;
            return;
        }

        self.functions.push(function);
    }

    /// Search for a function matching a call pattern in the format
    /// "print $ and $": identifiers must match stored literals exactly,
    /// `$` markers match stored parameters. First match wins.
    pub fn search(&self, search: &str) -> Option<Rc<Function>> {
        let pattern: Vec<&str> = search.split(' ').collect();

        self.functions
            .iter()
            .find(|f| call_pattern_matches(&pattern, &f.pattern))
            .map(Rc::clone)
    }
}

/// Match a split call pattern against a function's defining pattern
pub fn call_pattern_matches(call: &[&str], stored: &[PatternItem]) -> bool {
    if call.len() != stored.len() {
        return false;
    }

    call.iter().zip(stored.iter()).all(|(item, stored_item)| {
        if item.starts_with('$') {
            stored_item.is_param()
        } else {
            matches!(stored_item, PatternItem::Ident(name) if name == item)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn function(pattern: &[&str]) -> Rc<Function> {
        let items = pattern
            .iter()
            .map(|item| {
                if let Some(name) = item.strip_prefix('$') {
                    PatternItem::Param(name.to_string())
                } else {
                    PatternItem::Ident(item.to_string())
                }
            })
            .collect();

        Rc::new(Function {
            pattern: items,
            body: Rc::new(vec![]),
            constants: Rc::new(vec![]),
            names: vec![],
            patterns: vec![],
            on_call: None,
        })
    }

    #[test]
    fn defines_update_in_place() {
        let mut store = Store::new();
        let first = store.define("a", Value::Number(1.0), true);
        let second = store.define("a", Value::Number(2.0), true);

        assert_eq!(first, second);
        assert_eq!(store.data.len(), 1);
        assert!(store.get_name("a").unwrap().equals(&Value::Number(2.0)));
    }

    #[test]
    fn search_matches_exactly_one_pattern() {
        let mut fns = FunctionStore::new();
        fns.define(function(&["print", "$obj"]));
        fns.define(function(&["slice", "$col", "from", "$a", "to", "$b"]));

        let hit = fns.search("print $").unwrap();
        assert_eq!(hit.pattern_string(), "print $");

        assert!(fns.search("slice $ from $ to $").is_some());
        assert!(fns.search("print $ and $").is_none());
        assert!(fns.search("print print").is_none());
    }

    #[test]
    fn identifiers_must_match_literally() {
        let mut fns = FunctionStore::new();
        fns.define(function(&["$a", "to", "$b"]));

        assert!(fns.search("$ to $").is_some());
        assert!(fns.search("$ until $").is_none());
        // an identifier in the call can't stand in for a parameter
        assert!(fns.search("x to $").is_none());
    }

    #[test]
    fn redefining_a_pattern_replaces_it() {
        let mut fns = FunctionStore::new();
        fns.define(function(&["greet", "$name"]));
        fns.define(function(&["greet", "$person"]));

        assert_eq!(fns.functions.len(), 1);
    }

    #[test]
    fn module_merge_collects_local_bindings_and_functions() {
        let mut child = Store::new();
        child.define("answer", Value::Number(42.0), true);
        child.define("absorbed", Value::Number(1.0), false);
        child.functions.define(function(&["helper", "$x"]));

        let mut parent = Store::new();
        let (name, module) = parent.import_module(&child, "mathlib");
        assert_eq!(name, "mathlib");

        let module = match module {
            Value::Map(m) => m,
            other => panic!("expected a module map, got {:?}", other),
        };

        assert!(parent.get_name("mathlib").is_some());
        assert!(module.borrow().get_str("answer").unwrap().equals(&Value::Number(42.0)));
        assert!(module.borrow().get_str("absorbed").is_none());

        let methods_field = module.borrow().get_str("_methods");
        match methods_field {
            Some(Value::Array(methods)) => assert_eq!(methods.borrow().len(), 1),
            other => panic!("expected _methods array, got {:?}", other),
        }
    }

    #[test]
    fn module_merge_uses_module_title() {
        let mut meta = MapData::new();
        meta.set(Value::string("title"), Value::string("geometry"));

        let mut child = Store::new();
        child.define("_module", Value::map(meta), true);
        child.define("pi", Value::Number(3.14), true);

        let mut parent = Store::new();
        parent.import_module(&child, "file_name");

        assert!(parent.get_name("geometry").is_some());
        assert!(parent.get_name("file_name").is_none());
    }
}
