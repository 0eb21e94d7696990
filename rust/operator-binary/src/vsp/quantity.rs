//! Minimal Kubernetes resource-quantity parsing: just enough of the
//! suffix grammar (`m`, binary `Ki`/`Mi`/`Gi`/`Ti`, decimal `k`/`M`/`G`/`T`)
//! to turn CPU/memory quantities into comparable integers. Exponent and
//! fractional-binary-suffix forms are out of scope; the catalog and CRD
//! bounds this feeds from only ever use the common forms above.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1024),
    ("Mi", 1024 * 1024),
    ("Gi", 1024 * 1024 * 1024),
    ("Ti", 1024 * 1024 * 1024 * 1024),
];

const DECIMAL_SUFFIXES: &[(&str, i64)] = &[
    ("k", 1_000),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parses a CPU quantity (`"500m"`, `"2"`, `"1.5"`) into millicores.
pub fn parse_cpu_millis(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(stripped) = raw.strip_suffix('m') {
        return stripped.parse::<i64>().ok();
    }
    raw.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as i64)
}

/// Parses a memory quantity (`"4Gi"`, `"512Mi"`, `"1000000"`) into bytes.
pub fn parse_memory_bytes(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped.parse::<f64>().ok().map(|v| (v * *factor as f64).round() as i64);
        }
    }
    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped.parse::<f64>().ok().map(|v| (v * *factor as f64).round() as i64);
        }
    }
    raw.parse::<f64>().ok().map(|v| v.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("500m", 500)]
    #[case("2", 2000)]
    #[case("1.5", 1500)]
    fn cpu_parses_expected_millis(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(parse_cpu_millis(&Quantity(input.to_string())), Some(expected));
    }

    #[rstest]
    #[case("4Gi", 4 * 1024 * 1024 * 1024)]
    #[case("512Mi", 512 * 1024 * 1024)]
    #[case("1000000", 1_000_000)]
    #[case("2G", 2_000_000_000)]
    fn memory_parses_expected_bytes(#[case] input: &str, #[case] expected: i64) {
        assert_eq!(parse_memory_bytes(&Quantity(input.to_string())), Some(expected));
    }
}
