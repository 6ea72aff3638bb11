//! Debugger port allocation for worker runtime flags.
//!
//! A worker launched with `--inspect` would fight its siblings (and the parent)
//! for the default port, so every inspect flag is rewritten to a port of its
//! own before spawning.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::LaunchError;

pub const DEFAULT_INSPECTOR_PORT: u16 = 9229;

const INSPECT_FLAGS: [&str; 2] = ["--inspect", "--inspect-brk"];

/// Hands out increasing ports. Share one instance between every runner that
/// may be live at the same time.
#[derive(Debug)]
pub struct InspectorPortAllocator {
    next: AtomicU16,
}

impl Default for InspectorPortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl InspectorPortAllocator {
    /// Starts one above the default port, which the parent may be using.
    pub fn new() -> Self {
        Self::starting_at(DEFAULT_INSPECTOR_PORT + 1)
    }

    pub fn starting_at(port: u16) -> Self {
        Self {
            next: AtomicU16::new(port),
        }
    }

    /// `None` once the port range is used up.
    pub fn allocate(&self) -> Option<u16> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |port| {
                port.checked_add(1)
            })
            .ok()
    }
}

/// Rewrite every inspect flag in `args` to use a freshly allocated port.
///
/// `--inspect`, `--inspect=9229`, `--inspect=host:9229` and `--inspect 9229`
/// all become `--inspect=<port>`; the same goes for `--inspect-brk`. Returns
/// the rewritten arguments and the ports in the order they were bound.
pub fn rewrite_inspector_args(
    args: &[String],
    ports: &InspectorPortAllocator,
) -> Result<(Vec<String>, Vec<u16>), LaunchError> {
    let mut rewritten = Vec::with_capacity(args.len());
    let mut bound = Vec::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let (flag, value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (arg.as_str(), None),
        };
        if !INSPECT_FLAGS.contains(&flag) {
            rewritten.push(arg.clone());
            continue;
        }

        if value.is_none() && iter.peek().is_some_and(|next| is_port(next)) {
            iter.next();
        }
        let port = ports
            .allocate()
            .ok_or(LaunchError::InspectorPortsExhausted)?;
        rewritten.push(format!("{flag}={port}"));
        bound.push(port);
    }

    Ok((rewritten, bound))
}

fn is_port(arg: &str) -> bool {
    !arg.is_empty() && arg.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn untouched_without_inspect_flags() {
        let ports = InspectorPortAllocator::new();
        let (out, bound) = rewrite_inspector_args(&args(&["--trace", "9229"]), &ports).unwrap();
        assert_eq!(out, args(&["--trace", "9229"]));
        assert!(bound.is_empty());
    }

    #[test]
    fn every_form_gets_a_fresh_port() {
        let ports = InspectorPortAllocator::starting_at(9300);
        let input = args(&[
            "--inspect",
            "--inspect=9229",
            "--inspect-brk=localhost:9229",
            "--inspect-brk",
            "9229",
            "--max-old-space-size=4096",
        ]);
        let (out, bound) = rewrite_inspector_args(&input, &ports).unwrap();
        assert_eq!(
            out,
            args(&[
                "--inspect=9300",
                "--inspect=9301",
                "--inspect-brk=9302",
                "--inspect-brk=9303",
                "--max-old-space-size=4096",
            ])
        );
        assert_eq!(bound, vec![9300, 9301, 9302, 9303]);
    }

    #[test]
    fn default_allocator_skips_the_default_port() {
        let ports = InspectorPortAllocator::new();
        assert_eq!(ports.allocate(), Some(DEFAULT_INSPECTOR_PORT + 1));
    }

    #[test]
    fn allocations_strictly_increase() {
        let ports = InspectorPortAllocator::new();
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let ports = InspectorPortAllocator::starting_at(u16::MAX);
        let err = rewrite_inspector_args(&args(&["--inspect"]), &ports).unwrap_err();
        assert!(matches!(err, LaunchError::InspectorPortsExhausted));
    }
}
