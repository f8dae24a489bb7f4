//! Fault containment around every call into the engine.

use std::panic::{AssertUnwindSafe, catch_unwind};

/// Run `f`, converting a panic into `Err(message)` instead of letting it
/// unwind through the caller.
pub fn contain<F, T>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_passes_through() {
        assert_eq!(contain(|| 41 + 1), Ok(42));
    }

    #[test]
    fn str_panic_becomes_message() {
        let result: Result<(), String> = contain(|| panic!("engine fault"));
        assert_eq!(result, Err("engine fault".to_string()));
    }

    #[test]
    fn non_string_payload_is_opaque() {
        let result: Result<(), String> = contain(|| std::panic::resume_unwind(Box::new(7_i32)));
        assert_eq!(result, Err("unknown panic".to_string()));
    }
}
