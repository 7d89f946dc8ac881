use serde::Deserialize;

use crate::error::CoreError;

/// Configuration for debug dumps during the pipeline.
///
/// When enabled, dumps IR to stderr at key points. An optional function
/// filter restricts output to matching functions (see
/// [`DebugConfig::should_dump`] for matching rules).
#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    /// Dump the function to stderr once the pipeline has finished.
    pub dump_ir: bool,
    /// Filter dumps to functions whose name matches this string.
    pub function_filter: Option<String>,
    /// Stop the pipeline after the named pass and dump IR.
    ///
    /// Pass names use the same kebab-case as [`VectorizerConfig::from_skip_list`]
    /// (e.g. `"div-loop"`, `"linearize"`). The special value `"input"` dumps
    /// the function before any pass runs. Honoured by
    /// [`crate::pipeline::TransformPipeline::run_with_debug`].
    pub dump_ir_after: Option<String>,
}

impl DebugConfig {
    /// A config with all dumps disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether a dump of the kernel `func_name` passes the filter.
    ///
    /// The filter is a comma-separated list of kernel names. An entry
    /// ending in `*` matches every kernel with that prefix, so
    /// `"sum_*,dot"` selects `sum_rows`, `sum_cols` and `dot` but not
    /// `dot4`. Blank entries are ignored, and a filter with no entries
    /// matches nothing.
    pub fn should_dump(&self, func_name: &str) -> bool {
        let Some(filter) = self.function_filter.as_deref() else {
            return true;
        };
        filter
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .any(|entry| match entry.strip_suffix('*') {
                Some(prefix) => func_name.starts_with(prefix),
                None => func_name == entry,
            })
    }
}

/// Which optional stages the [`crate::Vectorizer`] runs.
///
/// All stages are enabled by default. Struct-opt and aggregate-split gate
/// stages the caller supplies; post-polish gates the built-in
/// [`crate::transforms::MaskPolish`] cleanup after linearization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VectorizerConfig {
    pub enable_struct_opt: bool,
    pub enable_aggregate_split: bool,
    pub enable_post_polish: bool,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            enable_struct_opt: true,
            enable_aggregate_split: true,
            enable_post_polish: true,
        }
    }
}

impl VectorizerConfig {
    /// Create a config with every stage enabled except those in the skip list.
    ///
    /// Stage names:
    /// - `"struct-opt"`
    /// - `"aggregate-split"`
    /// - `"post-polish"`
    ///
    /// Unknown names are ignored.
    pub fn from_skip_list(skip: &[&str]) -> Self {
        let mut config = Self::default();
        for name in skip {
            match *name {
                "struct-opt" => config.enable_struct_opt = false,
                "aggregate-split" => config.enable_aggregate_split = false,
                "post-polish" => config.enable_post_polish = false,
                _ => {}
            }
        }
        config
    }

    /// Parse a JSON object such as `{"enable_post_polish": false}`. Missing
    /// fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> DebugConfig {
        DebugConfig {
            function_filter: Some(s.to_string()),
            ..DebugConfig::default()
        }
    }

    #[test]
    fn no_filter_dumps_everything() {
        assert!(DebugConfig::none().should_dump("anything"));
    }

    #[test]
    fn names_match_exactly() {
        assert!(filter("sum_rows").should_dump("sum_rows"));
        assert!(!filter("sum").should_dump("sum_rows"));
        assert!(!filter("SUM_ROWS").should_dump("sum_rows"));
    }

    #[test]
    fn star_matches_a_prefix() {
        assert!(filter("sum_*").should_dump("sum_rows"));
        assert!(filter("sum_*").should_dump("sum_"));
        assert!(!filter("sum_*").should_dump("dot"));
        assert!(filter("*").should_dump("anything"));
    }

    #[test]
    fn lists_match_any_entry() {
        let f = filter(" sum_*, dot ,,");
        assert!(f.should_dump("sum_cols"));
        assert!(f.should_dump("dot"));
        assert!(!f.should_dump("dot4"));
        assert!(!filter(" , ").should_dump("dot"));
    }

    #[test]
    fn skip_list_disables_named_stages() {
        let config = VectorizerConfig::from_skip_list(&["post-polish", "no-such-stage"]);
        assert!(config.enable_struct_opt);
        assert!(config.enable_aggregate_split);
        assert!(!config.enable_post_polish);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = VectorizerConfig::from_json(r#"{"enable_struct_opt": false}"#).unwrap();
        assert_eq!(
            config,
            VectorizerConfig {
                enable_struct_opt: false,
                ..VectorizerConfig::default()
            }
        );
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = VectorizerConfig::from_json(r#"{"enable_everything": true}"#).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
