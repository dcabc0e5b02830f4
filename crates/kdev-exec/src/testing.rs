//! Test fixture for [`crate::Exec`].
//!
//! Install a handler that intercepts argv prefixes and returns a
//! canned response, then assert on the recorded call list afterward.

use crate::exec::{Exec, ExecOutput, ExecRequest};
use std::sync::Mutex;

/// A canned response for one matched argv prefix.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl MockResponse {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }
}

type Rule = (Vec<String>, MockResponse);

/// A fake [`Exec`] that matches requests by argv prefix, falling back
/// to a default success response for anything unmatched.
pub struct MockExec {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
    default: MockResponse,
}

impl Default for MockExec {
    fn default() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            default: MockResponse::ok(Vec::new()),
        }
    }
}

impl MockExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any argv starting with `prefix` with `response`.
    /// Rules are matched most-recently-added-first so a test can
    /// override a broad default with a specific case.
    pub fn on<I, S>(&self, prefix: I, response: MockResponse)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into_iter().map(Into::into).collect();
        self.rules.lock().unwrap().push((prefix, response));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn was_called_with_prefix<I, S>(&self, prefix: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix: Vec<String> = prefix.into_iter().map(Into::into).collect();
        self.calls()
            .iter()
            .any(|argv| argv.starts_with(&prefix))
    }
}

impl Exec for MockExec {
    fn exec(&self, req: &ExecRequest) -> anyhow::Result<ExecOutput> {
        self.calls.lock().unwrap().push(req.argv.clone());

        let rules = self.rules.lock().unwrap();
        let matched = rules
            .iter()
            .rev()
            .find(|(prefix, _)| req.argv.starts_with(prefix));

        let resp = matched.map(|(_, r)| r.clone()).unwrap_or_else(|| self.default.clone());
        Ok(ExecOutput {
            status: resp.status,
            stdout: resp.stdout,
            stderr: resp.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_calls_default_to_success() {
        let mock = MockExec::new();
        let out = mock.exec(&ExecRequest::new(["mkdir", "-p", "/tmp/x"])).unwrap();
        assert!(out.success());
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn matched_prefix_returns_canned_response() {
        let mock = MockExec::new();
        mock.on(["losetup", "-f", "--show"], MockResponse::ok("/dev/loop7\n"));
        let out = mock
            .exec(&ExecRequest::new(["losetup", "-f", "--show", "/tmp/test.img"]))
            .unwrap();
        assert_eq!(out.stdout_string(), "/dev/loop7");
        assert!(mock.was_called_with_prefix(["losetup"]));
    }

    #[test]
    fn later_rule_overrides_earlier_one() {
        let mock = MockExec::new();
        mock.on(["pvdisplay"], MockResponse::ok("first"));
        mock.on(["pvdisplay"], MockResponse::ok("second"));
        let out = mock.exec(&ExecRequest::new(["pvdisplay", "/dev/loop7"])).unwrap();
        assert_eq!(out.stdout_string(), "second");
    }
}
