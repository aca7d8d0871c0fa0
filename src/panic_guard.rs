// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Recovers panics raised by the codec.
//!
//! The backtrace must be captured while the panicking frames are still on
//! the stack, so a panic hook records it for the guarded thread before
//! unwinding reaches `catch_unwind`. Panics outside a guarded call go to
//! the previously installed hook.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

/// What is known about a recovered panic.
#[derive(Debug)]
pub(crate) struct PanicDetail {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: String,
}

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<(Option<String>, String)>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) {
                let location = info.location().map(ToString::to_string);
                let backtrace = Backtrace::force_capture().to_string();
                CAPTURED.with(|c| *c.borrow_mut() = Some((location, backtrace)));
            } else {
                previous(info);
            }
        }));
    });
}

/// Resets the guard flag even if `catch_unwind` itself unwinds.
struct Guarded;

impl Guarded {
    fn enter() -> Self {
        GUARDED.with(|g| g.set(true));
        Guarded
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        GUARDED.with(|g| g.set(false));
    }
}

/// Runs `f`, converting a panic into a [`PanicDetail`].
pub(crate) fn catch_codec_panic<T>(f: impl FnOnce() -> T) -> Result<T, PanicDetail> {
    install_hook();
    let result = {
        let _guard = Guarded::enter();
        panic::catch_unwind(AssertUnwindSafe(f))
    };
    result.map_err(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        let (location, backtrace) = CAPTURED
            .with(|c| c.borrow_mut().take())
            .unwrap_or_else(|| (None, Backtrace::force_capture().to_string()));
        PanicDetail {
            message,
            location,
            backtrace,
        }
    })
}
