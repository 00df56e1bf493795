//! Symbol demangling.
//!
//! External demanglers are keyed by their mangling prefix and tried first,
//! because the Itanium demangler happily chews on symbols emitted by other
//! languages while e.g. the Rust demangler rejects anything that did not
//! come from rustc. Symbols no demangler accepts pass through unchanged.

type DemangleFn = fn(&str) -> Option<String>;

struct ExternalDemangler {
    prefix: &'static str,
    demangle: DemangleFn,
}

pub struct Demangler {
    externals: Vec<ExternalDemangler>,
}

fn demangle_rust(mangled: &str) -> Option<String> {
    rustc_demangle::try_demangle(mangled)
        .ok()
        .map(|name| format!("{:#}", name))
}

impl Default for Demangler {
    fn default() -> Demangler {
        // A D demangler would register here with prefix "_D"; none is
        // available as a crate, so that chain slot stays empty and D
        // symbols fall through unchanged.
        Demangler {
            externals: vec![ExternalDemangler {
                prefix: "_R",
                demangle: demangle_rust,
            }],
        }
    }
}

impl Demangler {
    pub fn new() -> Demangler {
        Demangler::default()
    }

    #[cfg(test)]
    fn with_external(prefix: &'static str, demangle: DemangleFn) -> Demangler {
        let mut demangler = Demangler::new();
        demangler.externals.push(ExternalDemangler { prefix, demangle });
        demangler
    }

    pub fn demangle(&self, mangled: &str) -> String {
        if mangled.len() < 3 {
            return mangled.to_owned();
        }

        if let Some(external) = self
            .externals
            .iter()
            .find(|d| mangled.starts_with(d.prefix))
        {
            // fast path: the prefix picks the demangler
            if let Some(name) = (external.demangle)(mangled) {
                return name;
            }
        } else if let Some(name) = self.externals.iter().find_map(|d| (d.demangle)(mangled)) {
            // slow path: no prefix matched, let every demangler have a go
            return name;
        }

        if mangled.starts_with("_Z") {
            if let Ok(symbol) = cpp_demangle::Symbol::new(mangled.as_bytes()) {
                if let Ok(name) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
                    return name;
                }
            }
        }

        mangled.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_rust_v0() {
        let demangler = Demangler::new();
        assert_eq!(demangler.demangle("_RNvC6_123foo3bar"), "123foo::bar");
    }

    #[test]
    fn demangles_itanium() {
        let demangler = Demangler::new();
        assert_eq!(demangler.demangle("_ZN3foo3barEv"), "foo::bar()");
    }

    #[test]
    fn demangles_legacy_rust_via_slow_path() {
        // legacy rustc mangling uses the Itanium prefix but carries a rustc
        // hash; the slow path must hand it to the Rust demangler first
        let demangler = Demangler::new();
        assert_eq!(
            demangler.demangle("_ZN3std2io4Read11read_to_end17hb85a0f6802e14499E"),
            "std::io::Read::read_to_end"
        );
    }

    #[test]
    fn passes_through_plain_and_short_names() {
        let demangler = Demangler::new();
        assert_eq!(demangler.demangle("main"), "main");
        assert_eq!(demangler.demangle("g_main_context_new"), "g_main_context_new");
        assert_eq!(demangler.demangle("_Z"), "_Z");
    }

    #[test]
    fn external_chain_is_extensible() {
        fn demangle_d(mangled: &str) -> Option<String> {
            mangled.strip_prefix("_D").map(|rest| format!("d::{}", rest))
        }
        let demangler = Demangler::with_external("_D", demangle_d);
        assert_eq!(demangler.demangle("_D4main"), "d::4main");
        // a registered demangler must not swallow foreign symbols
        assert_eq!(demangler.demangle("_ZN3foo3barEv"), "foo::bar()");
    }
}
