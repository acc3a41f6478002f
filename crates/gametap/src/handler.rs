//! Handler registration and dispatch.
//!
//! Three independent phase chains (Request, Response, Connected), each an
//! insertion-ordered list of `(pattern, handler)` pairs. A pattern of `"*"`
//! matches everything; any other pattern matches when the request's `Host`
//! value contains it as a substring. Matching handlers compose: each one
//! receives the previous handler's output.

use std::sync::Arc;

use crate::ctx::ProxyCtx;
use crate::logger::Logger;

/// The wildcard pattern.
pub const ALL_HOSTS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
    Connected,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Connected => "connected",
        }
    }
}

pub type Handler = Arc<dyn Fn(&[u8], &mut ProxyCtx) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct PhaseHandlers {
    entries: Vec<(String, Handler)>,
    wildcard_installed: bool,
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    request: PhaseHandlers,
    response: PhaseHandlers,
    connected: PhaseHandlers,
}

impl HandlerRegistry {
    pub(crate) fn install(
        &mut self,
        phase: Phase,
        pattern: &str,
        handler: Handler,
        logger: &dyn Logger,
    ) {
        let handlers = self.phase_mut(phase);
        if handlers.wildcard_installed {
            logger.warn(&format!("{} handler [*] already exists", phase.label()));
        }
        if pattern == ALL_HOSTS {
            handlers.wildcard_installed = true;
        }
        handlers.entries.push((pattern.to_string(), handler));
    }

    /// Runs every matching handler in insertion order, threading the body
    /// through the chain.
    pub(crate) fn dispatch(
        &self,
        phase: Phase,
        host: &str,
        body: &[u8],
        ctx: &mut ProxyCtx,
    ) -> Vec<u8> {
        let mut current = body.to_vec();
        for (pattern, handler) in &self.phase(phase).entries {
            if pattern == ALL_HOSTS || host.contains(pattern.as_str()) {
                current = handler(&current, ctx);
            }
        }
        current
    }

    pub(crate) fn has_handlers(&self, phase: Phase) -> bool {
        !self.phase(phase).entries.is_empty()
    }

    fn phase(&self, phase: Phase) -> &PhaseHandlers {
        match phase {
            Phase::Request => &self.request,
            Phase::Response => &self.response,
            Phase::Connected => &self.connected,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseHandlers {
        match phase {
            Phase::Request => &mut self.request,
            Phase::Response => &mut self.response,
            Phase::Connected => &mut self.connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{HandlerRegistry, Phase, ALL_HOSTS};
    use crate::ctx::ProxyCtx;
    use crate::http1::parse_request_head;
    use crate::logger::Logger;

    #[derive(Default)]
    struct CountingLogger {
        warnings: AtomicUsize,
    }

    impl Logger for CountingLogger {
        fn debug(&self, _message: &str) {}
        fn info(&self, _message: &str) {}
        fn warn(&self, _message: &str) {
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
        fn error(&self, _message: &str) {}
        fn fatal(&self, _message: &str) {}
    }

    fn test_ctx() -> ProxyCtx {
        let head = parse_request_head(b"POST /p HTTP/1.1\r\nHost: api.svc.test\r\n\r\n")
            .expect("request head");
        ProxyCtx::new(head)
    }

    #[test]
    fn matching_handlers_compose_in_insertion_order() {
        let logger = CountingLogger::default();
        let mut registry = HandlerRegistry::default();
        registry.install(
            Phase::Request,
            "svc.test",
            Arc::new(|body, _ctx| {
                let mut out = body.to_vec();
                out.extend_from_slice(b"+first");
                out
            }),
            &logger,
        );
        registry.install(
            Phase::Request,
            "api.",
            Arc::new(|body, _ctx| {
                let mut out = body.to_vec();
                out.extend_from_slice(b"+second");
                out
            }),
            &logger,
        );
        registry.install(
            Phase::Request,
            "unrelated.example",
            Arc::new(|_body, _ctx| b"clobbered".to_vec()),
            &logger,
        );

        let mut ctx = test_ctx();
        let out = registry.dispatch(Phase::Request, "api.svc.test", b"base", &mut ctx);
        assert_eq!(out, b"base+first+second");
    }

    #[test]
    fn wildcard_matches_every_host() {
        let logger = CountingLogger::default();
        let mut registry = HandlerRegistry::default();
        registry.install(
            Phase::Response,
            ALL_HOSTS,
            Arc::new(|body, _ctx| body.iter().rev().copied().collect()),
            &logger,
        );

        let mut ctx = test_ctx();
        let out = registry.dispatch(Phase::Response, "anything.at.all", b"abc", &mut ctx);
        assert_eq!(out, b"cba");
    }

    #[test]
    fn registration_after_wildcard_warns_but_still_applies() {
        let logger = CountingLogger::default();
        let mut registry = HandlerRegistry::default();
        registry.install(
            Phase::Request,
            ALL_HOSTS,
            Arc::new(|body, _ctx| {
                let mut out = b"*".to_vec();
                out.extend_from_slice(body);
                out
            }),
            &logger,
        );
        assert_eq!(logger.warnings.load(Ordering::Relaxed), 0);

        registry.install(
            Phase::Request,
            "svc.test",
            Arc::new(|body, _ctx| {
                let mut out = body.to_vec();
                out.extend_from_slice(b"!");
                out
            }),
            &logger,
        );
        assert_eq!(logger.warnings.load(Ordering::Relaxed), 1);

        let mut ctx = test_ctx();
        let out = registry.dispatch(Phase::Request, "api.svc.test", b"x", &mut ctx);
        assert_eq!(out, b"*x!");
    }

    #[test]
    fn phases_are_independent() {
        let logger = CountingLogger::default();
        let mut registry = HandlerRegistry::default();
        registry.install(
            Phase::Request,
            ALL_HOSTS,
            Arc::new(|body, _ctx| body.to_vec()),
            &logger,
        );

        assert!(registry.has_handlers(Phase::Request));
        assert!(!registry.has_handlers(Phase::Response));
        assert!(!registry.has_handlers(Phase::Connected));

        let mut ctx = test_ctx();
        let out = registry.dispatch(Phase::Connected, "api.svc.test", b"", &mut ctx);
        assert!(out.is_empty());
    }
}
