//! Hypervisor shell.
//!
//! A thin client over the core: whitespace-delimited commands with
//! single/double quoting, executed against the hypervisor context.
//! Output is rendered into a string for whatever console carries it
//! (byte channel or UART).

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::guest::gcpu::GcpuStat;
use crate::guest::{self, Guest};
use crate::hv::Hypervisor;

/// Split a command line into words, honoring single and double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => cur.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(core::mem::take(&mut cur));
                        in_word = false;
                    }
                }
                c => {
                    cur.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        words.push(cur);
    }
    words
}

fn find_guest(hv: &Hypervisor, out: &mut String, name: &str) -> Option<Arc<Guest>> {
    match hv.guest_by_name(name) {
        Some(g) => Some(g),
        None => {
            let _ = writeln!(out, "no such partition: {}", name);
            None
        }
    }
}

fn state_str(guest: &Guest) -> &'static str {
    use crate::guest::GuestState::*;
    match guest.state() {
        Stopped => "stopped",
        Running => {
            if guest.is_paused() {
                "paused"
            } else {
                "running"
            }
        }
        Starting => "starting",
        Stopping => "stopping",
    }
}

/// Execute one command line; returns the rendered output.
pub fn run_command(hv: &Arc<Hypervisor>, line: &str) -> String {
    let words = tokenize(line);
    let mut out = String::new();

    let cmd = match words.first() {
        Some(c) => c.as_str(),
        None => return out,
    };

    match cmd {
        "help" => {
            out.push_str(
                "commands: list-partitions partition-info guest-device-tree \
                 master-device-tree start stop restart pause resume paact help\n",
            );
        }

        "list-partitions" => {
            let _ = writeln!(out, "{:<8} {:<20} {:<10} cpus", "lpid", "name", "state");
            for g in hv.guests() {
                let cores: Vec<usize> = g.gcpus.iter().map(|c| c.coreid).collect();
                let _ = writeln!(out, "{:<8} {:<20} {:<10} {:?}", g.lpid, g.name,
                                 state_str(&g), cores);
            }
        }

        "partition-info" => match words.get(1) {
            Some(name) => {
                if let Some(g) = find_guest(hv, &mut out, name) {
                    let _ = writeln!(out, "partition {} (lpid {}): {}", g.name, g.lpid,
                                     state_str(&g));
                    if let Some(reason) = g.hypervisor_strprop("fsl,hv-reason-stopped") {
                        let by = g
                            .hypervisor_strprop("fsl,hv-stopped-by")
                            .unwrap_or_else(|| "?".to_string());
                        let _ = writeln!(out, "  last stop: {} (by {})", reason, by);
                    }
                    for gcpu in &g.gcpus {
                        let _ = writeln!(
                            out,
                            "  vcpu {} on core {}: emu {} (tlbwe {}, spr {}), decr {}",
                            gcpu.gcpu_num,
                            gcpu.coreid,
                            gcpu.stat(GcpuStat::EmuTotal),
                            gcpu.stat(GcpuStat::EmuTlbwe),
                            gcpu.stat(GcpuStat::EmuSpr),
                            gcpu.stat(GcpuStat::Decr)
                        );
                    }
                }
            }
            None => out.push_str("usage: partition-info <name>\n"),
        },

        "guest-device-tree" => match (words.get(1).map(String::as_str), words.get(2)) {
            (Some("print"), Some(name)) => {
                if let Some(g) = find_guest(hv, &mut out, name) {
                    let gdt = g.gdt.lock();
                    let root = gdt.root();
                    gdt.print(root, &mut out);
                }
            }
            _ => out.push_str("usage: guest-device-tree print <name>\n"),
        },

        "master-device-tree" => {
            let tree = hv.config_tree.lock();
            let root = tree.root();
            tree.print(root, &mut out);
        }

        "start" | "stop" | "restart" | "pause" | "resume" => match words.get(1) {
            Some(name) => {
                if let Some(g) = find_guest(hv, &mut out, name) {
                    let result = match cmd {
                        "start" => guest::start_guest(&g, true),
                        "stop" => guest::stop_guest(&g, "stop", "shell"),
                        "restart" => guest::restart_guest(&g, "restart", "shell"),
                        "pause" => guest::pause_guest(&g),
                        _ => guest::resume_guest(&g),
                    };
                    match result {
                        Ok(()) => {
                            let _ = writeln!(out, "{}: {}", g.name, state_str(&g));
                        }
                        Err(e) => {
                            let _ = writeln!(out, "{} failed: {:?}", cmd, e);
                        }
                    }
                }
            }
            None => {
                let _ = writeln!(out, "usage: {} <partition>", cmd);
            }
        },

        "paact" => {
            let _ = writeln!(out, "{:<8} {:<18} {:<6} {:<18} valid", "liodn", "wbase", "wse",
                             "twbase");
            let mut liodn = 0u32;
            while liodn < 1024 {
                if let Some(p) = hv.pamu.window(liodn) {
                    let _ = writeln!(out, "{:<8} {:<#18x} {:<6} {:<#18x} {}",
                                     p.liodn, p.wbase, p.wse, p.twbase, p.valid);
                }
                liodn += 1;
            }
        }

        other => {
            let _ = writeln!(out, "unknown command: {}", other);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(tokenize("a b  c"), ["a", "b", "c"]);
        assert_eq!(tokenize("stop 'my part'"), ["stop", "my part"]);
        assert_eq!(tokenize("echo \"two words\" three"), ["echo", "two words", "three"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
        assert_eq!(tokenize("a''b"), ["ab"]);
    }

    #[test]
    fn test_list_and_lifecycle_commands() {
        let hv = Hypervisor::new_bare();
        let g = Guest::new_bare_with_hv(&hv, "demo", 1, &[0]);

        let out = run_command(&hv, "list-partitions");
        assert!(out.contains("demo"));
        assert!(out.contains("stopped"));

        run_command(&hv, "start demo");
        assert_eq!(g.state(), crate::guest::GuestState::Running);

        let out = run_command(&hv, "pause demo");
        assert!(out.contains("paused"));
        run_command(&hv, "resume demo");

        let out = run_command(&hv, "stop demo");
        assert!(out.contains("stopped"));

        let out = run_command(&hv, "partition-info demo");
        assert!(out.contains("last stop: stop (by shell)"));
    }

    #[test]
    fn test_guest_device_tree_print() {
        let hv = Hypervisor::new_bare();
        Guest::new_bare_with_hv(&hv, "demo", 1, &[0]);
        let out = run_command(&hv, "guest-device-tree print demo");
        assert!(out.contains("hypervisor"));
        assert!(out.contains("fsl,hv"));
    }

    #[test]
    fn test_unknown_command() {
        let hv = Hypervisor::new_bare();
        let out = run_command(&hv, "frobnicate");
        assert!(out.contains("unknown command"));
    }

    #[test]
    fn test_paact_dump() {
        let hv = Hypervisor::new_bare();
        hv.pamu.set_window(7, 0x1000_0000, 24, 0x2000_0000);
        let out = run_command(&hv, "paact");
        assert!(out.contains("0x10000000"));
    }
}
