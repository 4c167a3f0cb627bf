//! Handler-tag routing.
//!
//! Modules register the handler-tag prefixes they want to receive. On
//! delivery the dispatcher returns, in registration order, the modules
//! whose registrations match the message's handler tag; the hosting
//! service queues one delivery per matching module in that module's
//! phase. The tag `"any"` is a wildcard in both directions: a
//! registration for `"any"` sees every message, and a message whose tag
//! starts with `"any"` goes to every registered module.

use log::warn;

/// One `(module, tag prefix)` registration.
#[derive(Debug, Clone)]
struct Registration {
    module: String,
    tag: String,
}

/// The routing table.
#[derive(Debug, Default)]
pub struct Dispatcher {
    registrations: Vec<Registration>,
}

impl Dispatcher {
    /// An empty table.
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Register `module` for handler tags starting with `tag`.
    pub fn register(&mut self, module: impl Into<String>, tag: impl Into<String>) {
        self.registrations.push(Registration {
            module: module.into(),
            tag: tag.into(),
        });
    }

    /// The modules that should receive a message with this handler tag,
    /// deduplicated, in registration order. Logs and returns empty when
    /// nothing matches.
    pub fn route(&self, handler: &str) -> Vec<&str> {
        let mut matched: Vec<&str> = Vec::new();
        for reg in &self.registrations {
            let hit = if reg.tag == "any" {
                true
            } else if handler.starts_with("any") {
                true
            } else {
                handler.starts_with(reg.tag.as_str())
            };
            if hit && !matched.contains(&reg.module.as_str()) {
                matched.push(reg.module.as_str());
            }
        }
        if matched.is_empty() {
            warn!("message '{handler}' was not processed by any module");
        }
        matched
    }

    /// True once at least one module is registered.
    pub fn has_registrations(&self) -> bool {
        !self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Dispatcher {
        let mut d = Dispatcher::new();
        d.register("gm", "gm.");
        d.register("gm", "any");
        d.register("sc", "sc.");
        d.register("sc", "any");
        d.register("lb", "lb.");
        d
    }

    #[test]
    fn test_exact_module_match() {
        let d = table();
        // gm.* reaches gm directly and sc through its "any" wildcard.
        assert_eq!(d.route("gm.Invite"), vec!["gm", "sc"]);
        assert_eq!(d.route("lb.CollectedState"), vec!["gm", "sc", "lb"]);
    }

    #[test]
    fn test_any_message_reaches_all_modules() {
        let d = table();
        assert_eq!(d.route("any.PeerList"), vec!["gm", "sc", "lb"]);
    }

    #[test]
    fn test_module_delivered_once() {
        let d = table();
        // gm matches both "gm." and "any" but appears once.
        let routes = d.route("gm.Accept");
        assert_eq!(routes.iter().filter(|m| **m == "gm").count(), 1);
    }

    #[test]
    fn test_unmatched_returns_empty() {
        let mut d = Dispatcher::new();
        d.register("lb", "lb.");
        assert!(d.route("gm.Invite").is_empty());
    }

    #[test]
    fn test_registration_order_preserved() {
        let mut d = Dispatcher::new();
        d.register("lb", "lb.");
        d.register("gm", "any");
        assert_eq!(d.route("lb.demand"), vec!["lb", "gm"]);
    }
}
