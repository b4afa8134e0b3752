//! The host boundary: native functions and host-object members exposed to
//! scripts by name, with argument/return coercion at the VM edge.

use std::rc::Rc;

/// The exchange type crossing the host boundary in both directions.
///
/// The VM coerces [`crate::vm::Value`] to and from this type at every
/// native call and host member access; heap-resident strings are copied
/// out. Script objects other than strings do not cross the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Nil,
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Int(_) => "int",
            HostValue::Bool(_) => "bool",
            HostValue::Str(_) => "string",
            HostValue::Nil => "nil",
        }
    }
}

/// A host callback registered into the globals table by name.
/// Invoked synchronously; the VM blocks until it returns.
pub type NativeFn = Rc<dyn Fn(&[HostValue]) -> Result<HostValue, String>>;

/// A host object whose members are resolved by name through reflection on
/// the host side. Missing members and unsupported types must surface as
/// errors naming the offending member.
pub trait HostObject {
    /// Host-side type name, used in script-facing error messages.
    fn type_name(&self) -> &str;

    fn get(&self, member: &str) -> Result<HostValue, String> {
        Err(missing_member(self.type_name(), member))
    }

    fn set(&mut self, member: &str, _value: HostValue) -> Result<(), String> {
        Err(missing_member(self.type_name(), member))
    }

    fn invoke(&mut self, member: &str, _args: &[HostValue]) -> Result<HostValue, String> {
        Err(missing_member(self.type_name(), member))
    }
}

/// Standard wording for a failed member lookup.
pub fn missing_member(type_name: &str, member: &str) -> String {
    format!("{} has no member named '{}'", type_name, member)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: i64,
    }

    impl HostObject for Counter {
        fn type_name(&self) -> &str {
            "Counter"
        }

        fn get(&self, member: &str) -> Result<HostValue, String> {
            match member {
                "count" => Ok(HostValue::Int(self.count)),
                _ => Err(missing_member(self.type_name(), member)),
            }
        }

        fn set(&mut self, member: &str, value: HostValue) -> Result<(), String> {
            match (member, value) {
                ("count", HostValue::Int(n)) => {
                    self.count = n;
                    Ok(())
                }
                ("count", other) => Err(format!(
                    "cannot assign {} to member 'count'",
                    other.type_name()
                )),
                _ => Err(missing_member(self.type_name(), member)),
            }
        }

        fn invoke(&mut self, member: &str, args: &[HostValue]) -> Result<HostValue, String> {
            match member {
                "add" => match args {
                    [HostValue::Int(n)] => {
                        self.count += n;
                        Ok(HostValue::Int(self.count))
                    }
                    _ => Err("add expects one int argument".to_string()),
                },
                _ => Err(missing_member(self.type_name(), member)),
            }
        }
    }

    #[test]
    fn test_get_set_invoke() {
        let mut c = Counter { count: 1 };
        assert_eq!(c.get("count"), Ok(HostValue::Int(1)));
        c.set("count", HostValue::Int(5)).unwrap();
        assert_eq!(c.invoke("add", &[HostValue::Int(2)]), Ok(HostValue::Int(7)));
    }

    #[test]
    fn test_missing_member_names_the_member() {
        let mut c = Counter { count: 0 };
        let err = c.invoke("frobnicate", &[]).unwrap_err();
        assert!(err.contains("frobnicate"));
        assert!(err.contains("Counter"));
    }

    #[test]
    fn test_unsupported_type_names_the_member() {
        let mut c = Counter { count: 0 };
        let err = c.set("count", HostValue::Str("x".to_string())).unwrap_err();
        assert!(err.contains("count"));
    }
}
