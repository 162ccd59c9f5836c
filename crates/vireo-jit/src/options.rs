//! Host-supplied configuration
//!
//! The host parses its command line and hands the result over once at
//! init. Options never change after that, so reads are lock-free.

use once_cell::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Size of the executable arena allocation, in MiB (split between the
    /// inline and outlined blocks)
    pub exec_mem_size: usize,

    /// Method calls before the host requests compilation
    pub call_threshold: usize,

    /// Generate versions greedily until the limit is hit
    pub greedy_versioning: bool,

    /// Disable type propagation between instructions
    pub no_type_prop: bool,

    /// Maximum block versions per bytecode position; 1 means always
    /// compile the generic version
    pub max_versions: usize,

    /// Collect and report counters
    pub gen_stats: bool,

    /// Verify contexts against live values at block entries
    pub self_check: bool,

    /// Debug dump verbosity: 0 quiet, 1 block ranges, 2 everything
    pub dump_mode: u8,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            exec_mem_size: 64,
            call_threshold: 10,
            greedy_versioning: false,
            no_type_prop: false,
            max_versions: 4,
            gen_stats: false,
            self_check: cfg!(debug_assertions),
            dump_mode: 0,
        }
    }
}

impl Options {
    /// Parse one `key=value` (or bare flag) option string. Returns false
    /// on anything unrecognized so the host can report it.
    pub fn parse_one(&mut self, opt: &str) -> bool {
        let (key, val) = match opt.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (opt, None),
        };
        match (key, val) {
            ("exec-mem-size", Some(v)) => match v.parse() {
                Ok(n) if n > 0 => {
                    self.exec_mem_size = n;
                    true
                }
                _ => false,
            },
            ("call-threshold", Some(v)) => v.parse().map(|n| self.call_threshold = n).is_ok(),
            ("max-versions", Some(v)) => match v.parse() {
                Ok(n) if n > 0 => {
                    self.max_versions = n;
                    true
                }
                _ => false,
            },
            ("greedy-versioning", None) => {
                self.greedy_versioning = true;
                true
            }
            ("no-type-prop", None) => {
                self.no_type_prop = true;
                true
            }
            ("stats", None) => {
                self.gen_stats = true;
                true
            }
            ("self-check", None) => {
                self.self_check = true;
                true
            }
            ("dump", Some(v)) => match v.parse() {
                Ok(n) if n <= 2 => {
                    self.dump_mode = n;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

static OPTIONS: OnceCell<Options> = OnceCell::new();

/// Install the parsed options. First caller wins; later calls are ignored.
pub fn install(opts: Options) {
    let _ = OPTIONS.set(opts);
}

pub fn get() -> &'static Options {
    OPTIONS.get_or_init(Options::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_options() {
        let mut opts = Options::default();
        assert!(opts.parse_one("exec-mem-size=128"));
        assert_eq!(opts.exec_mem_size, 128);
        assert!(opts.parse_one("max-versions=2"));
        assert_eq!(opts.max_versions, 2);
        assert!(opts.parse_one("greedy-versioning"));
        assert!(opts.greedy_versioning);
        assert!(opts.parse_one("stats"));
        assert!(opts.gen_stats);
        assert!(opts.parse_one("dump=2"));
        assert_eq!(opts.dump_mode, 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut opts = Options::default();
        assert!(!opts.parse_one("exec-mem-size=zero"));
        assert!(!opts.parse_one("exec-mem-size=0"));
        assert!(!opts.parse_one("dump=9"));
        assert!(!opts.parse_one("warble"));
        assert_eq!(opts, Options::default());
    }
}
