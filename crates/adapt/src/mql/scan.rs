// crates/adapt/src/mql/scan.rs
//
// In-process execution: used by the file backend, by index-assisted reads
// and by anything else that evaluates a query over materialized documents.

use super::ast::{Query, SortDir};
use super::eval::eval_filter;
use crate::Result;
use domain::value::compare_values;
use domain::{Document, FieldPath};
use std::cmp::Ordering;

/// Sort in place by the query's sort keys; ties fall back to primary key
/// ascending so results are deterministic on every backend.
pub fn apply_sort(docs: &mut [Document], sort: &[(FieldPath, SortDir)]) {
    docs.sort_by(|a, b| {
        for (path, dir) in sort {
            let ord = compare_values(a.lookup(path.as_str()), b.lookup(path.as_str()));
            if ord != Ordering::Equal {
                return match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
            }
        }
        a.key().cmp(&b.key())
    });
}

/// Apply skip + limit to a vector, returning a new owned Vec.
pub fn apply_skip_limit(docs: Vec<Document>, skip: usize, limit: Option<usize>) -> Vec<Document> {
    docs.into_iter()
        .skip(skip)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Filter, sort and page already-materialized documents.
pub fn run(docs: impl IntoIterator<Item = Document>, query: &Query) -> Vec<Document> {
    let mut matched: Vec<Document> = docs
        .into_iter()
        .filter(|d| eval_filter(query.filter(), d))
        .collect();
    apply_sort(&mut matched, query.sort());
    apply_skip_limit(matched, query.offset_value(), query.limit_value())
}

/// Lazy variant over a key-ordered source. Without sort keys the source
/// order (ascending key) already is the result order, so documents are
/// filtered and paged as they stream by; with sort keys everything is
/// collected first.
pub fn stream<'a, I>(source: I, query: &Query) -> Box<dyn Iterator<Item = Result<Document>> + 'a>
where
    I: Iterator<Item = Document> + 'a,
{
    if query.sort().is_empty() {
        let filter = query.filter().clone();
        Box::new(
            source
                .filter(move |d| eval_filter(&filter, d))
                .skip(query.offset_value())
                .take(query.limit_value().unwrap_or(usize::MAX))
                .map(Ok),
        )
    } else {
        Box::new(run(source, query).into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::ast::Filter;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        vec![
            Document::from_json(json!({ "n": 3, "s": "b" })).unwrap().with_key("k1"),
            Document::from_json(json!({ "n": 1 })).unwrap().with_key("k2"),
            Document::from_json(json!({ "n": "x" })).unwrap().with_key("k3"),
            Document::from_json(json!({ "s": "a" })).unwrap().with_key("k4"),
            Document::from_json(json!({ "n": 1.0 })).unwrap().with_key("k0"),
        ]
    }

    fn keys(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.key().unwrap().as_str()).collect()
    }

    #[test]
    fn sort_mixes_kinds_in_canonical_order_with_key_ties() {
        let mut d = docs();
        apply_sort(&mut d, &[(FieldPath::parse("n").unwrap(), SortDir::Asc)]);
        // absent < numbers (ties by key) < strings
        assert_eq!(keys(&d), vec!["k4", "k0", "k2", "k1", "k3"]);

        apply_sort(&mut d, &[(FieldPath::parse("n").unwrap(), SortDir::Desc)]);
        assert_eq!(keys(&d), vec!["k3", "k1", "k0", "k2", "k4"]);
    }

    #[test]
    fn skip_limit_bounds() {
        let d = docs();
        assert_eq!(apply_skip_limit(d.clone(), 1, Some(2)).len(), 2);
        assert_eq!(apply_skip_limit(d.clone(), 10, None).len(), 0);
        assert_eq!(apply_skip_limit(d, 0, None).len(), 5);
    }

    #[test]
    fn run_filters_then_sorts_then_pages() {
        let q = Query::new(Filter::exists("n", true).unwrap())
            .sort_by("n", SortDir::Desc)
            .unwrap()
            .offset(1)
            .limit(2);
        assert_eq!(keys(&run(docs(), &q)), vec!["k1", "k0"]);
    }

    #[test]
    fn stream_without_sort_keeps_source_order() {
        let q = Query::new(Filter::exists("s", true).unwrap()).limit(1);
        let out: Vec<Document> = stream(docs().into_iter(), &q)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(keys(&out), vec!["k1"]);
    }
}
