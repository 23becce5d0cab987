//! Cluster submission templates.
//!
//! Templates carry `__MRO_<KEY>__` placeholders. A line whose placeholder
//! resolves to an empty value is dropped, so optional scheduler flags vanish
//! instead of being emitted half-filled.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Placeholder values, keyed without the `__MRO_` / `__` wrapping.
pub type TemplateParams = BTreeMap<String, String>;

#[allow(clippy::unwrap_used)]
fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"__MRO_([A-Z_]+?)__").unwrap())
}

/// Renders `template` with `params`.
///
/// Unknown placeholders are left untouched.
#[must_use]
pub fn render_template(template: &str, params: &TemplateParams) -> String {
    let mut out = String::with_capacity(template.len());
    for line in template.split_inclusive('\n') {
        let drop_line = placeholder()
            .captures_iter(line)
            .any(|c| params.get(&c[1]).is_some_and(String::is_empty));
        if drop_line {
            continue;
        }
        let rendered = placeholder().replace_all(line, |c: &regex::Captures<'_>| {
            params
                .get(&c[1])
                .cloned()
                .unwrap_or_else(|| c[0].to_string())
        });
        out.push_str(&rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &str)]) -> TemplateParams {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_render_replaces_placeholders() {
        let template = "#!/bin/sh\n#$ -N __MRO_JOB_NAME__\n#$ -pe smp __MRO_THREADS__\n__MRO_CMD__\n";
        let out = render_template(
            template,
            &params(&[("JOB_NAME", "p.S.main"), ("THREADS", "4"), ("CMD", "run it")]),
        );
        assert_eq!(out, "#!/bin/sh\n#$ -N p.S.main\n#$ -pe smp 4\nrun it\n");
    }

    #[test]
    fn test_render_drops_lines_with_empty_values() {
        let template = "#$ -A __MRO_ACCOUNT__\n#$ -l mem=__MRO_MEM_GB__G\n";
        let out = render_template(template, &params(&[("ACCOUNT", ""), ("MEM_GB", "8")]));
        assert_eq!(out, "#$ -l mem=8G\n");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let out = render_template("x __MRO_NOPE__ y", &params(&[]));
        assert_eq!(out, "x __MRO_NOPE__ y");
    }
}
