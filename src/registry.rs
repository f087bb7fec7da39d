use std::collections::HashMap;

use crate::value::Value;

/// Registry trait for host-provided functions
///
/// This trait is the only seam between the VM core and the host
/// application. The `CallExternal` opcode resolves a name from the
/// string table and delegates here with the popped arguments
/// (`args[0]` is the first popped value).
///
/// Failures are plain strings at this seam; the VM wraps them into its
/// own error type together with the function name.
pub trait FunctionRegistry {
    /// Invoke a host function by name
    ///
    /// Returns Err when the name is unregistered or the call fails.
    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Value, String>;
}

type HostFn = Box<dyn FnMut(&[Value]) -> Result<Value, String>>;

/// A registry backed by a name → closure map
///
/// Suits hosts that bind a handful of functions by hand, and tests.
#[derive(Default)]
pub struct MapRegistry {
    functions: HashMap<String, HostFn>,
}

impl MapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a name, replacing any previous binding
    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: FnMut(&[Value]) -> Result<Value, String> + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(func));
    }
}

impl FunctionRegistry for MapRegistry {
    fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Value, String> {
        match self.functions.get_mut(name) {
            Some(func) => func(args),
            None => Err(format!("unregistered function: {}", name)),
        }
    }
}

/// A registry with no functions; every lookup fails
///
/// Useful for programs that never call out, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRegistry;

impl FunctionRegistry for NullRegistry {
    fn invoke(&mut self, name: &str, _args: &[Value]) -> Result<Value, String> {
        Err(format!("unregistered function: {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_registry_dispatch() {
        let mut registry = MapRegistry::new();
        registry.register("double", |args| {
            let n = args
                .first()
                .and_then(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .ok_or("double() requires an int")?;
            Ok(Value::Int(n * 2))
        });

        let result = registry.invoke("double", &[Value::Int(21)]).unwrap();
        assert!(result.eq_value(&Value::Int(42)));

        assert!(registry.invoke("missing", &[]).is_err());
    }

    #[test]
    fn test_null_registry_rejects() {
        let mut registry = NullRegistry;
        assert!(registry.invoke("anything", &[]).is_err());
    }
}
