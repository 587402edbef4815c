//! Host functions exposed to Smart Functions.
//!
//! Scripts only reach the outside world through the inventory lookups
//! registered here. Lookups are synchronous and answered from an in-process
//! cache, so no async work happens while a script runs. The active
//! [`DeviceLookup`] and the invocation deadline are bound to the executing
//! thread for the duration of one invocation; once the deadline has passed
//! every host call throws.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Instant;

use boa_engine::{Context, JsNativeError, JsResult, JsString, JsValue, NativeFunction};
use serde_json::Value;

/// Read-only device lookups available to scripts.
pub trait DeviceLookup: Send + Sync {
    /// Managed object by platform id.
    fn managed_object(&self, id: &str) -> Option<Value>;

    /// Managed object by external id and external id type.
    fn by_external_id(&self, external_id: &str, id_type: &str) -> Option<Value>;

    /// Parent managed object of a device, from its `assetParents`.
    fn parent(&self, id: &str) -> Option<Value>;
}

/// Lookup that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

impl DeviceLookup for NoDevices {
    fn managed_object(&self, _id: &str) -> Option<Value> {
        None
    }

    fn by_external_id(&self, _external_id: &str, _id_type: &str) -> Option<Value> {
        None
    }

    fn parent(&self, _id: &str) -> Option<Value> {
        None
    }
}

thread_local! {
    static ACTIVE_LOOKUP: RefCell<Option<Arc<dyn DeviceLookup>>> = RefCell::new(None);
    static DEADLINE: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Binds a lookup and a deadline to the current thread until dropped.
pub(crate) struct LookupGuard;

impl LookupGuard {
    pub(crate) fn bind(lookup: Arc<dyn DeviceLookup>, deadline: Option<Instant>) -> Self {
        ACTIVE_LOOKUP.with(|slot| *slot.borrow_mut() = Some(lookup));
        DEADLINE.with(|slot| slot.set(deadline));
        LookupGuard
    }
}

impl Drop for LookupGuard {
    fn drop(&mut self) {
        ACTIVE_LOOKUP.with(|slot| slot.borrow_mut().take());
        DEADLINE.with(|slot| slot.set(None));
    }
}

/// Whether the invocation bound to this thread ran past its deadline.
pub(crate) fn deadline_passed() -> bool {
    DEADLINE.with(|slot| slot.get().is_some_and(|deadline| Instant::now() >= deadline))
}

fn check_deadline() -> JsResult<()> {
    if deadline_passed() {
        return Err(JsNativeError::error()
            .with_message("Smart Function deadline exceeded")
            .into());
    }
    Ok(())
}

/// Names of the global host functions the wrapper script calls.
pub(crate) const HOST_MANAGED_OBJECT: &str = "__host_managed_object";
pub(crate) const HOST_BY_EXTERNAL_ID: &str = "__host_by_external_id";
pub(crate) const HOST_PARENT: &str = "__host_parent";

/// Register the host functions in a fresh context.
pub(crate) fn register(context: &mut Context<'_>) -> JsResult<()> {
    context.register_global_callable(
        HOST_MANAGED_OBJECT,
        1,
        NativeFunction::from_fn_ptr(host_managed_object),
    )?;
    context.register_global_callable(
        HOST_BY_EXTERNAL_ID,
        2,
        NativeFunction::from_fn_ptr(host_by_external_id),
    )?;
    context.register_global_callable(HOST_PARENT, 1, NativeFunction::from_fn_ptr(host_parent))?;
    Ok(())
}

fn string_arg(args: &[JsValue], index: usize) -> JsResult<String> {
    args.get(index)
        .and_then(JsValue::as_string)
        .map(JsString::to_std_string_escaped)
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("argument {} must be a string", index))
                .into()
        })
}

/// Run a lookup against the bound provider and hand the result to the
/// script as JSON text (`null` when nothing was found).
fn lookup_json(f: impl FnOnce(&dyn DeviceLookup) -> Option<Value>) -> JsValue {
    let found = ACTIVE_LOOKUP.with(|slot| slot.borrow().as_ref().and_then(|l| f(l.as_ref())));
    match found {
        Some(value) => JsValue::from(JsString::from(value.to_string().as_str())),
        None => JsValue::null(),
    }
}

fn host_managed_object(_this: &JsValue, args: &[JsValue], _ctx: &mut Context<'_>) -> JsResult<JsValue> {
    check_deadline()?;
    let id = string_arg(args, 0)?;
    Ok(lookup_json(|lookup| lookup.managed_object(&id)))
}

fn host_by_external_id(_this: &JsValue, args: &[JsValue], _ctx: &mut Context<'_>) -> JsResult<JsValue> {
    check_deadline()?;
    let external_id = string_arg(args, 0)?;
    let id_type = string_arg(args, 1)?;
    Ok(lookup_json(|lookup| lookup.by_external_id(&external_id, &id_type)))
}

fn host_parent(_this: &JsValue, args: &[JsValue], _ctx: &mut Context<'_>) -> JsResult<JsValue> {
    check_deadline()?;
    let id = string_arg(args, 0)?;
    Ok(lookup_json(|lookup| lookup.parent(&id)))
}
