//! The handful of natives every embedding gets by default. Hosts can
//! register more, or replace these, before running a chunk.

use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::vm::native::HostValue;
use crate::vm::{RuntimeError, VM};

/// Render a host value the way `print` shows it.
pub fn display(value: &HostValue) -> String {
    match value {
        HostValue::Int(n) => n.to_string(),
        HostValue::Bool(b) => b.to_string(),
        HostValue::Str(s) => s.clone(),
        HostValue::Nil => "nil".to_string(),
    }
}

/// Register `print`, `clock`, and `assert` into the globals table.
pub fn register_default_natives(vm: &mut VM) -> Result<(), RuntimeError> {
    vm.register_native(
        "print",
        1,
        Rc::new(|args: &[HostValue]| {
            println!("{}", display(&args[0]));
            Ok(HostValue::Nil)
        }),
    )?;

    vm.register_native(
        "clock",
        0,
        Rc::new(|_: &[HostValue]| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| e.to_string())?
                .as_millis();
            Ok(HostValue::Int(millis as i64))
        }),
    )?;

    vm.register_native(
        "assert",
        1,
        Rc::new(|args: &[HostValue]| {
            let ok = match &args[0] {
                HostValue::Bool(b) => *b,
                HostValue::Nil => false,
                _ => true,
            };
            if ok {
                Ok(HostValue::Nil)
            } else {
                Err("assertion failed".to_string())
            }
        }),
    )?;

    Ok(())
}
