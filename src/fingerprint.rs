//! C1 — deterministic content fingerprint over a normalized [`Release`].
//!
//! The canonical serializer is written from scratch over an internal
//! [`FpValue`] tree rather than relying on any library's map-iteration
//! order (`serde_json::Value::Object` is a `BTreeMap` today, but that is an
//! implementation detail we should not depend on for a value that gets
//! persisted and compared across runs).

use sha2::{Digest, Sha512};

use crate::model::{FpValue, Release};

/// Computes the 32-hex-char fingerprint of a [`Release`].
///
/// Two calls with equal `release` values always produce equal output,
/// regardless of the order fields were populated in, because the
/// serializer sorts every map level by key before hashing.
pub fn fingerprint(release: &Release) -> String {
    let tree = release_to_tree(release);
    let canonical = serialize_canonical(&tree);
    let digest = Sha512::digest(canonical.as_bytes());
    hex::encode(&digest[..16])
}

fn release_to_tree(release: &Release) -> FpValue {
    let mut fields: Vec<(String, FpValue)> = vec![
        ("name".into(), FpValue::Str(release.name.clone())),
        ("version".into(), FpValue::Str(release.version.clone())),
        ("summary".into(), FpValue::Str(release.summary.clone())),
        (
            "description".into(),
            FpValue::Str(release.description.clone()),
        ),
        ("license".into(), FpValue::Str(release.license.clone())),
        ("author".into(), FpValue::Str(release.author.clone())),
        (
            "author_email".into(),
            FpValue::Str(release.author_email.clone()),
        ),
        (
            "maintainer".into(),
            FpValue::Str(release.maintainer.clone()),
        ),
        (
            "maintainer_email".into(),
            FpValue::Str(release.maintainer_email.clone()),
        ),
        (
            "classifiers".into(),
            str_list(&sorted_dedup(&release.classifiers)),
        ),
        (
            "uris".into(),
            FpValue::Map(
                release
                    .uris
                    .iter()
                    .map(|(k, v)| (k.clone(), FpValue::Str(v.clone())))
                    .collect(),
            ),
        ),
        (
            "requires_python".into(),
            FpValue::Str(release.requires_python.clone()),
        ),
        (
            "requires_external".into(),
            str_list(&release.requires_external),
        ),
        ("platforms".into(), str_list(&release.platforms)),
        (
            "supported_platforms".into(),
            str_list(&release.supported_platforms),
        ),
        ("keywords".into(), str_list(&release.keywords)),
        ("requires".into(), requirement_list(&release.requires)),
        ("provides".into(), requirement_list(&release.provides)),
        ("obsoletes".into(), requirement_list(&release.obsoletes)),
        (
            "created".into(),
            match &release.created {
                Some(ts) => FpValue::Str(ts.to_rfc3339()),
                None => FpValue::Null,
            },
        ),
        ("yanked".into(), FpValue::Bool(release.yanked)),
    ];

    let files = FpValue::List(
        release
            .files
            .iter()
            .map(|f| {
                FpValue::Map(
                    f.fingerprint_fields()
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                )
            })
            .collect(),
    );
    fields.push(("files".into(), files));

    FpValue::Map(fields)
}

fn sorted_dedup(items: &[String]) -> Vec<String> {
    let mut out: Vec<String> = items.to_vec();
    out.sort();
    out.dedup();
    out
}

fn str_list(items: &[String]) -> FpValue {
    FpValue::List(items.iter().cloned().map(FpValue::Str).collect())
}

fn requirement_list(items: &[crate::model::RequirementSpec]) -> FpValue {
    FpValue::List(
        items
            .iter()
            .map(|r| {
                FpValue::Map(vec![
                    ("name".into(), FpValue::Str(r.name.clone())),
                    ("version".into(), FpValue::Str(r.version.clone())),
                    ("environment".into(), FpValue::Str(r.environment.clone())),
                ])
            })
            .collect(),
    )
}

/// Serializes an `FpValue` tree to a stable textual form: maps are emitted
/// as `[key, value]` pairs sorted lexicographically by key at every depth;
/// lists preserve the order given (callers are responsible for sorting
/// anything that is semantically a set before building the tree).
fn serialize_canonical(value: &FpValue) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &FpValue, out: &mut String) {
    match value {
        FpValue::Null => out.push_str("null"),
        FpValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FpValue::Int(i) => out.push_str(&i.to_string()),
        FpValue::Str(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        FpValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        FpValue::Map(entries) => {
            let mut sorted: Vec<&(String, FpValue)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('[');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('[');
                write_value(&FpValue::Str(k.clone()), out);
                out.push(',');
                write_value(v, out);
                out.push(']');
            }
            out.push(']');
        }
    }
}
