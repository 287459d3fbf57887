//! error_core is a default implementation of [zerror::Z].

use std::backtrace::Backtrace;
use std::fmt::Debug;

use biometrics::Counter;

use zerror::Z;

///////////////////////////////////////////// ErrorCore ////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
struct Internals {
    email: String,
    short: String,
    backtrace: String,
    info: Vec<(String, String)>,
}

/// [ErrorCore] implements 100% of Z for easy error reporting.  It's intended that people will wrap
/// and proxy ErrorCore and then implement a short summary on top that descends from an error enum.
#[derive(Clone, Debug, Default)]
pub struct ErrorCore {
    internals: Box<Internals>,
}

impl ErrorCore {
    /// Create a new ErrorCore with the provided email and short summary.  The provided counter
    /// will be clicked each time a new error is created, to give people insight into the error.
    /// It's advisable to have a separate counter for different conditions.
    pub fn new(email: &str, short: &str, counter: &'static Counter) -> Self {
        counter.click();
        let backtrace = format!("{}", Backtrace::force_capture());
        let internals = Internals {
            email: email.to_owned(),
            short: short.to_owned(),
            backtrace,
            info: Vec::new(),
        };
        Self {
            internals: Box::new(internals),
        }
    }
}

impl Z for ErrorCore {
    type Error = Self;

    fn long_form(&self) -> String {
        let mut s = String::default();
        s += &format!("{}\n\nOWNER: {}", self.internals.short, self.internals.email);
        if !self.internals.info.is_empty() {
            s += "\n";
            for (name, value) in self.internals.info.iter() {
                s += &format!("\n{name}: {value}");
            }
        }
        s += &format!("\n\nbacktrace:\n{}", self.internals.backtrace);
        s
    }

    fn with_info<X: Debug>(mut self, name: &str, value: X) -> Self::Error {
        self.set_info(name, value);
        self
    }

    fn with_lazy_info<F: FnOnce() -> String>(mut self, name: &str, value: F) -> Self::Error {
        self.set_lazy_info(name, value);
        self
    }
}

impl ErrorCore {
    /// Record debug formatting of a value under `name`.
    pub fn set_info<X: Debug>(&mut self, name: &str, value: X) {
        self.internals
            .info
            .push((name.to_owned(), format!("{value:?}")));
    }

    /// Record a lazily-computed string under `name`.
    pub fn set_lazy_info<F: FnOnce() -> String>(&mut self, name: &str, value: F) {
        self.internals.info.push((name.to_owned(), value()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE: Counter = Counter::new("zerror_core.tests.sample");

    #[test]
    fn long_form_includes_owner_and_info() {
        let mut core = ErrorCore::new("dev@example.com", "something broke", &SAMPLE);
        core.set_info("resource", "widget-1");
        let long = core.long_form();
        assert!(long.contains("something broke"));
        assert!(long.contains("OWNER: dev@example.com"));
        assert!(long.contains("resource: \"widget-1\""));
    }

    #[test]
    fn with_info_is_chainable() {
        let core = ErrorCore::new("dev@example.com", "oops", &SAMPLE)
            .with_info("a", 1)
            .with_info("b", 2);
        assert_eq!(2, core.internals.info.len());
    }
}
