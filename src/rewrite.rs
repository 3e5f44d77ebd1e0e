//! Pre-parse query rewriter.
//!
//! Scans statements for the three `MYVECTOR` annotations and expands them
//! into standard SQL before the host parser sees them:
//!
//! 1. `MYVECTOR(type=…,dim=…)` column declarations in `CREATE TABLE` /
//!    `ALTER TABLE` become `VARBINARY(n)` columns whose comment preserves
//!    the option string.
//! 2. `MYVECTOR_IS_ANN(vec, id, qvec [,opts])` predicates become an
//!    `id IN (SELECT … FROM JSON_TABLE(myvector_ann_set(…)))` subquery.
//! 3. `MYVECTOR_SEARCH[base, id, index, query_table [,opts]]` table forms
//!    become a `FROM base WHERE id IN (…)` join against the query table.
//!
//! Each rewrite is applied repeatedly until no occurrence remains. The
//! rewriter never corrupts a query: on any failure the original text is
//! returned unchanged.

use std::sync::OnceLock;

use regex::Regex;

use crate::options::OptionsMap;
use crate::payload::{MAX_DIM, MIN_DIM, VectorKind};

const COLUMN_ANNOTATION: &str = "MYVECTOR(";
const IS_ANN_ANNOTATION: &str = "MYVECTOR_IS_ANN(";
const SEARCH_ANNOTATION: &str = "MYVECTOR_SEARCH";

/// Option strings must fit a column comment.
const MAX_COLUMN_INFO_LEN: usize = 128;

const DEFAULT_INDEX_TYPE: &str = "type=KNN";

fn create_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^CREATE\s+TABLE").unwrap())
}

fn alter_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^ALTER\s+TABLE").unwrap())
}

fn select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^SELECT\s+").unwrap())
}

fn explain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^EXPLAIN\s+").unwrap())
}

/// Split an annotation parameter list on commas, trimming whitespace.
/// Parameters carrying nested commas (function calls) survive because
/// callers only index parameters left of any nested expression.
fn split_params(params: &str) -> Vec<String> {
    params
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rewrite every `MYVECTOR(...)` column declaration. Errors abort the
/// whole statement rewrite.
fn rewrite_column_defs(query: &str) -> Option<String> {
    let mut out = query.to_string();

    while let Some(pos) = out.find(COLUMN_ANNOTATION) {
        let spos = pos + COLUMN_ANNOTATION.len();
        let epos = out[pos..].find(')').map(|e| pos + e)?;

        let colinfo = out[spos..epos].to_string();
        if colinfo.len() > MAX_COLUMN_INFO_LEN {
            tracing::error!(len = colinfo.len(), "MYVECTOR column info too long");
            return None;
        }

        let opts = match OptionsMap::parse(&colinfo) {
            Ok(opts) => opts,
            Err(e) => {
                tracing::error!(options = %colinfo, error = %e, "MYVECTOR column options parse error");
                return None;
            }
        };

        let (colinfo, vtype) = match opts.get("type") {
            Some(t) => (colinfo, t.to_string()),
            None => (
                format!("{DEFAULT_INDEX_TYPE},{colinfo}"),
                "KNN".to_string(),
            ),
        };

        let Some(dim) = opts.get_usize("dim") else {
            tracing::error!("MYVECTOR column dimension not defined");
            return None;
        };
        if !(MIN_DIM..=MAX_DIM).contains(&dim) {
            tracing::error!(dim, "MYVECTOR column dimension incorrect");
            return None;
        }

        let kind = if vtype == "HNSW_BV" {
            VectorKind::Bit
        } else {
            VectorKind::Float32
        };
        let width = kind.storage_len(dim);

        let mut new_column = format!("VARBINARY({width}) COMMENT 'MYVECTOR Column |{colinfo}'");
        if let Some(track) = opts.get("track") {
            new_column.push_str(&format!(
                ", {track} TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP"
            ));
        }

        out = format!("{}{}{}", &out[..pos], new_column, &out[epos + 1..]);
    }

    Some(out)
}

/// Rewrite every `MYVECTOR_IS_ANN(...)` predicate. Arguments may nest
/// parentheses (`myvector_construct(...)`), so the closing paren is found
/// by balance counting.
fn rewrite_is_ann(query: &str) -> Option<String> {
    let mut out = query.to_string();

    while let Some(pos) = out.find(IS_ANN_ANNOTATION) {
        let spos = pos + IS_ANN_ANNOTATION.len();
        let bytes = out.as_bytes();
        let mut depth = 1;
        let mut epos = spos;
        while epos < bytes.len() {
            match bytes[epos] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            epos += 1;
        }
        if depth != 0 {
            tracing::error!("MYVECTOR_IS_ANN unbalanced parentheses");
            return None;
        }

        let params = out[spos..epos].to_string();
        let parts = split_params(&params);
        if parts.len() < 3 {
            tracing::error!(params = %params, "MYVECTOR_IS_ANN needs at least 3 arguments");
            return None;
        }

        let idcol = parts[1].trim_matches('\'');

        let replacement = format!(
            "( {idcol} IN (select `myvecid` from JSON_TABLE(myvector_ann_set({params}), \
             \"$[*]\" COLUMNS(`myvecid` BIGINT PATH \"$\")) `myvector_ann`) )"
        );

        out = format!("{}{}{}", &out[..pos], replacement, &out[epos + 1..]);
    }

    Some(out)
}

/// Rewrite every `MYVECTOR_SEARCH[...]` (or `{...}`) table form. The
/// query table must expose its probe vector in a `searchvec` column.
fn rewrite_search(query: &str) -> Option<String> {
    let mut out = query.to_string();

    while let Some(pos) = out.find(SEARCH_ANNOTATION) {
        let mut spos = pos + SEARCH_ANNOTATION.len();
        let close = match out.as_bytes().get(spos) {
            Some(b'[') => ']',
            Some(b'{') => '}',
            _ => {
                tracing::error!("MYVECTOR_SEARCH missing opening bracket");
                return None;
            }
        };
        spos += 1;
        let epos = out[spos..].find(close).map(|e| spos + e)?;

        let params = split_params(&out[spos..epos]);
        if !(4..=5).contains(&params.len()) {
            tracing::error!(
                "incorrect MYVECTOR_SEARCH syntax, usage: \
                 MYVECTOR_SEARCH[baseTable,idColumn,vectorColumn,queryTable[,options]]"
            );
            return None;
        }

        let base_table = &params[0];
        let idcol = &params[1];
        let vec_index = &params[2];
        let query_table = &params[3];
        let annopt = params.get(4).map(String::as_str).unwrap_or("");

        let replacement = format!(
            "{base_table} where {idcol} in (select myvecid from {query_table} b, \
             json_table(myvector_ann_set('{vec_index}','{idcol}', searchvec, '{annopt}') , \
             \"$[*]\" COLUMNS(`myvecid` BIGINT PATH \"$\")) `myvector_ann`)"
        );

        out = format!("{}{}{}", &out[..pos], replacement, &out[epos + 1..]);
    }

    Some(out)
}

/// Entry point of the pre-parse hook. Returns `Some(rewritten)` when the
/// statement changed, `None` to leave it untouched (including on any
/// rewrite failure).
pub fn rewrite_query(query: &str) -> Option<String> {
    // Cheap gates: statement class initial, then the annotation marker.
    let first = query.chars().next()?;
    if !"CcAaSsEe".contains(first) {
        return None;
    }
    if !query.contains("MYVECTOR") {
        return None;
    }

    let rewritten = if select_re().is_match(query) || explain_re().is_match(query) {
        if query.contains(IS_ANN_ANNOTATION) {
            rewrite_is_ann(query)
        } else if query.contains(SEARCH_ANNOTATION) {
            rewrite_search(query)
        } else {
            None
        }
    } else if (create_table_re().is_match(query) || alter_table_re().is_match(query))
        && query.contains(COLUMN_ANNOTATION)
    {
        rewrite_column_defs(query)
    } else {
        None
    };

    match rewritten {
        Some(new_query) if new_query != query => {
            tracing::info!(query = %new_query, "MYVECTOR query rewrite");
            Some(new_query)
        }
        _ => None,
    }
}
