//! Output naming: region abbreviation, rename templates, latency suffixes
//! and uniqueness. Also the caller-side helpers for keyword exclusion and
//! deduplication.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{IpInfo, Node, TestResult};
use crate::parser::query::fully_decode;
use crate::parser::reindex;

pub const DEFAULT_RENAME_FMT: &str = "{region} {name}";
pub const DEFAULT_LATENCY_FMT: &str = "{avg}ms";
pub const DEFAULT_IP_NAME_FMT: &str = "{region_code}-{random}";
const FALLBACK_NAME: &str = "node";

/// `pattern=REGION`: a node whose name or host contains `pattern`
/// (case-insensitively) is tagged `REGION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRule {
    pub pattern: String,
    pub region: String,
}

/// Naming part of the run settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingOptions {
    pub rename: bool,
    pub rename_fmt: String,
    pub region_rules: Vec<RegionRule>,
    pub latency_name: bool,
    pub latency_fmt: String,
    pub ip_rename: bool,
    pub ip_name_fmt: String,
}

/// Country, region and city names mapped to short codes.
static REGION_CODES: &[(&str, &str)] = &[
    ("Hong Kong", "HK"),
    ("Hongkong", "HK"),
    ("Taiwan", "TW"),
    ("Singapore", "SG"),
    ("Singapore City", "SG"),
    ("Japan", "JP"),
    ("Tokyo", "JP"),
    ("Osaka", "JP"),
    ("Korea", "KR"),
    ("South Korea", "KR"),
    ("Seoul", "KR"),
    ("Thailand", "TH"),
    ("Vietnam", "VN"),
    ("Malaysia", "MY"),
    ("Indonesia", "ID"),
    ("Philippines", "PH"),
    ("India", "IN"),
    ("Pakistan", "PK"),
    ("Bangladesh", "BD"),
    ("Nepal", "NP"),
    ("Sri Lanka", "LK"),
    ("Myanmar", "MM"),
    ("Cambodia", "KH"),
    ("Laos", "LA"),
    ("Mongolia", "MN"),
    ("Kazakhstan", "KZ"),
    ("Uzbekistan", "UZ"),
    ("Georgia", "GE"),
    ("Armenia", "AM"),
    ("Azerbaijan", "AZ"),
    ("Turkey", "TR"),
    ("Israel", "IL"),
    ("United Arab Emirates", "AE"),
    ("UAE", "AE"),
    ("Saudi Arabia", "SA"),
    ("Qatar", "QA"),
    ("Kuwait", "KW"),
    ("Bahrain", "BH"),
    ("Oman", "OM"),
    ("Iran", "IR"),
    ("Iraq", "IQ"),
    ("Jordan", "JO"),
    ("Lebanon", "LB"),
    ("China", "CN"),
    ("Shanghai", "CN"),
    ("Beijing", "CN"),
    ("Shenzhen", "CN"),
    ("Guangzhou", "CN"),
    ("Macao", "MO"),
    ("Macau", "MO"),
    ("United Kingdom", "UK"),
    ("UK", "UK"),
    ("Great Britain", "UK"),
    ("England", "UK"),
    ("Scotland", "UK"),
    ("Wales", "UK"),
    ("Northern Ireland", "UK"),
    ("London", "UK"),
    ("Manchester", "UK"),
    ("Germany", "DE"),
    ("Frankfurt", "DE"),
    ("Berlin", "DE"),
    ("Hamburg", "DE"),
    ("Hesse", "DE"),
    ("Hessen", "DE"),
    ("Bavaria", "DE"),
    ("France", "FR"),
    ("Paris", "FR"),
    ("Marseille", "FR"),
    ("Netherlands", "NL"),
    ("Amsterdam", "NL"),
    ("North Holland", "NL"),
    ("South Holland", "NL"),
    ("Belgium", "BE"),
    ("Luxembourg", "LU"),
    ("Switzerland", "CH"),
    ("Zurich", "CH"),
    ("Geneva", "CH"),
    ("Austria", "AT"),
    ("Vienna", "AT"),
    ("Poland", "PL"),
    ("Czech Republic", "CZ"),
    ("Czechia", "CZ"),
    ("Slovakia", "SK"),
    ("Hungary", "HU"),
    ("Romania", "RO"),
    ("Bulgaria", "BG"),
    ("Greece", "GR"),
    ("Serbia", "RS"),
    ("Croatia", "HR"),
    ("Slovenia", "SI"),
    ("Moldova", "MD"),
    ("Ukraine", "UA"),
    ("Belarus", "BY"),
    ("Lithuania", "LT"),
    ("Latvia", "LV"),
    ("Estonia", "EE"),
    ("Finland", "FI"),
    ("Sweden", "SE"),
    ("Norway", "NO"),
    ("Denmark", "DK"),
    ("Iceland", "IS"),
    ("Ireland", "IE"),
    ("Portugal", "PT"),
    ("Spain", "ES"),
    ("Madrid", "ES"),
    ("Italy", "IT"),
    ("Milan", "IT"),
    ("Rome", "IT"),
    ("Cyprus", "CY"),
    ("Russia", "RU"),
    ("Russian Federation", "RU"),
    ("Moscow", "RU"),
    ("United States", "US"),
    ("USA", "US"),
    ("America", "US"),
    ("Los Angeles", "US"),
    ("San Francisco", "US"),
    ("San Jose", "US"),
    ("Silicon Valley", "US"),
    ("Seattle", "US"),
    ("New York", "US"),
    ("Chicago", "US"),
    ("Dallas", "US"),
    ("Miami", "US"),
    ("Ashburn", "US"),
    ("California", "US"),
    ("Virginia", "US"),
    ("Oregon", "US"),
    ("Texas", "US"),
    ("Canada", "CA"),
    ("Toronto", "CA"),
    ("Vancouver", "CA"),
    ("Montreal", "CA"),
    ("Ontario", "CA"),
    ("Quebec", "CA"),
    ("British Columbia", "CA"),
    ("Mexico", "MX"),
    ("Brazil", "BR"),
    ("Argentina", "AR"),
    ("Chile", "CL"),
    ("Peru", "PE"),
    ("Colombia", "CO"),
    ("Australia", "AU"),
    ("Sydney", "AU"),
    ("Melbourne", "AU"),
    ("New Zealand", "NZ"),
    ("South Africa", "ZA"),
    ("Egypt", "EG"),
    ("Nigeria", "NG"),
    ("Kenya", "KE"),
    ("Morocco", "MA"),
];

/// Region names longest first, so that `South Korea` wins over `Korea`.
static REGIONS_BY_LENGTH: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    let mut regions = REGION_CODES.to_vec();
    regions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    regions
});

/// Four random digits.
pub fn random_suffix() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

/// Short code for a country or region name. Unknown names fall back to their
/// first two letters, uppercased.
pub fn country_code(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return String::new();
    }
    let lower = name.to_lowercase();
    if let Some((_, code)) = REGION_CODES
        .iter()
        .find(|(region, _)| region.to_lowercase() == lower)
    {
        return code.to_string();
    }
    if let Some((_, code)) = REGIONS_BY_LENGTH.iter().find(|(region, _)| {
        let region = region.to_lowercase();
        lower.contains(&region) || region.contains(&lower)
    }) {
        return code.to_string();
    }
    name.chars().take(2).collect::<String>().to_uppercase()
}

pub fn display_name(node: &Node) -> &str {
    if !node.name.is_empty() {
        &node.name
    } else if !node.host.is_empty() {
        &node.host
    } else {
        &node.raw
    }
}

/// 2-3 uppercase ASCII letters.
fn is_region_code(s: &str) -> bool {
    (2..=3).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_uppercase())
}

/// Replaces full region names with their codes and folds the duplicates that
/// leaves behind: `Ontario Ontario-7834` becomes `CA-7834`.
///
/// A match must not touch an ASCII letter on either side, so `UK` does not
/// fire inside `Fukuoka`.
pub fn abbreviate_region(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let decoded = fully_decode(name);
    let mut out = decoded.clone();
    for (region, code) in REGIONS_BY_LENGTH.iter() {
        out = replace_word_ignore_case(&out, region, code);
    }
    if out == decoded {
        return out.trim().to_string();
    }

    let mut cleaned: Vec<&str> = Vec::new();
    for part in out.split_whitespace() {
        if let Some(last) = cleaned.last_mut()
            && is_region_code(last)
        {
            if part == *last {
                continue;
            }
            if part
                .strip_prefix(*last)
                .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('_'))
            {
                *last = part;
                continue;
            }
        }
        cleaned.push(part);
    }
    cleaned
        .join(" ")
        .replace(" - ", "-")
        .replace(" -", "-")
        .replace("- ", "-")
}

fn replace_word_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return haystack.to_string();
    }
    let mut out = String::with_capacity(haystack.len());
    let mut prev: Option<char> = None;
    let mut rest = haystack;
    while let Some(c) = rest.chars().next() {
        if !prev.is_some_and(|p| p.is_ascii_alphabetic())
            && let Some(len) = match_prefix_ignore_case(rest, &needle)
            && !rest[len..].chars().next().is_some_and(|n| n.is_ascii_alphabetic())
        {
            out.push_str(replacement);
            prev = replacement.chars().last();
            rest = &rest[len..];
            continue;
        }
        out.push(c);
        prev = Some(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Byte length of the prefix of `s` that equals `needle` (already
/// lowercased) ignoring case.
fn match_prefix_ignore_case(s: &str, needle: &[char]) -> Option<usize> {
    let mut matched = 0;
    for (i, c) in s.char_indices() {
        if matched == needle.len() {
            return Some(i);
        }
        for lc in c.to_lowercase() {
            if needle.get(matched) != Some(&lc) {
                return None;
            }
            matched += 1;
        }
    }
    (matched == needle.len()).then_some(s.len())
}

/// Decodes, abbreviates and deduplicates `name` against `counts`.
/// Collisions become `name_2`, `name_3`, ...
pub fn unique_name(name: &str, counts: &mut HashMap<String, usize>) -> String {
    let mut base = fully_decode(name.trim());
    if base.is_empty() {
        base = FALLBACK_NAME.to_string();
    }
    base = abbreviate_region(&base);
    if base.is_empty() {
        base = FALLBACK_NAME.to_string();
    }

    let mut seen = counts.get(&base).copied().unwrap_or(0);
    if seen == 0 {
        counts.insert(base.clone(), 1);
        return base;
    }
    loop {
        seen += 1;
        let candidate = format!("{base}_{seen}");
        if !counts.contains_key(&candidate) {
            counts.insert(base, seen);
            counts.insert(candidate.clone(), 1);
            return candidate;
        }
    }
}

/// Parses `pattern=REGION` lines. Blank lines and `#` comments are skipped.
pub fn parse_region_rules(text: &str) -> Vec<RegionRule> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(pattern, region)| (pattern.trim(), region.trim()))
        .filter(|(pattern, region)| !pattern.is_empty() && !region.is_empty())
        .map(|(pattern, region)| RegionRule {
            pattern: pattern.to_string(),
            region: region.to_string(),
        })
        .collect()
}

/// Splits on `,`, `;` and newlines; keywords are lowercased.
pub fn parse_keywords(text: &str) -> Vec<String> {
    text.split([',', ';', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// True when any keyword occurs in the node's name, original name, host or
/// raw text.
pub fn should_exclude(node: &Node, keywords: &[String]) -> bool {
    let target = [&node.name, &node.original_name, &node.host, &node.raw]
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && target.contains(&k.to_lowercase()))
}

pub fn filter_by_keywords(nodes: Vec<Node>, keywords: &[String]) -> Vec<Node> {
    if keywords.is_empty() {
        return nodes;
    }
    nodes
        .into_iter()
        .filter(|n| !should_exclude(n, keywords))
        .collect()
}

/// Keeps the first node per `(scheme, host, port)` and reindexes.
pub fn dedup_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    let mut out: Vec<Node> = nodes
        .into_iter()
        .filter(|n| seen.insert(n.endpoint_key()))
        .collect();
    reindex(&mut out);
    out
}

pub fn match_region(name: &str, host: &str, rules: &[RegionRule]) -> Option<String> {
    let target = format!("{name} {host}").to_lowercase();
    rules
        .iter()
        .find(|r| target.contains(&r.pattern.to_lowercase()))
        .map(|r| r.region.clone())
}

/// Expands `{region}`, `{name}`, `{host}`, `{scheme}` and `{index}`.
pub fn format_name(
    fmt: &str,
    region: &str,
    name: &str,
    host: &str,
    scheme: &str,
    index: usize,
) -> String {
    let fmt = if fmt.is_empty() { DEFAULT_RENAME_FMT } else { fmt };
    let out = fmt
        .replace("{region}", region)
        .replace("{name}", name)
        .replace("{host}", host)
        .replace("{scheme}", scheme)
        .replace("{index}", &index.to_string())
        .trim()
        .to_string();
    match out.is_empty() {
        true if !name.is_empty() => name.to_string(),
        true => host.to_string(),
        false => out,
    }
}

pub fn format_ip_region(info: &IpInfo) -> String {
    if !info.region.is_empty() {
        return country_code(&info.region);
    }
    if !info.country.is_empty() {
        return country_code(&info.country);
    }
    String::new()
}

/// Expands an IP rename template. Besides the geolocation fields,
/// `{residential}` and `{random}` are supported.
pub fn format_ip_name(fmt: &str, info: &IpInfo) -> String {
    let fmt = if fmt.is_empty() { DEFAULT_IP_NAME_FMT } else { fmt };
    let country_code = if info.country_code.is_empty() {
        country_code(&info.country)
    } else {
        info.country_code.clone()
    };
    let mut region_code = self::country_code(&info.region);
    if region_code.is_empty() {
        region_code = country_code.clone();
    }
    let residential = if info.is_residential() {
        "residential"
    } else {
        "datacenter"
    };
    fmt.replace("{country}", &info.country)
        .replace("{country_code}", &country_code)
        .replace("{region}", &info.region)
        .replace("{region_code}", &region_code)
        .replace("{city}", &info.city)
        .replace("{isp}", &info.isp)
        .replace("{org}", &info.org)
        .replace("{asn}", &info.asn)
        .replace("{ip}", &info.ip)
        .replace("{residential}", residential)
        .replace("{random}", &random_suffix())
        .trim()
        .to_string()
}

/// Appends the latency suffix, or expands the template in place when it
/// mentions `{name}`.
pub fn apply_latency_name(name: &str, fmt: &str, result: &TestResult) -> String {
    let fmt = if fmt.is_empty() { DEFAULT_LATENCY_FMT } else { fmt };
    let min = if result.latency_ms.is_empty() {
        result.avg_ms
    } else {
        result.min_ms()
    };
    let out = fmt
        .replace("{avg}", &result.avg_ms.to_string())
        .replace("{max}", &result.max_ms.to_string())
        .replace("{min}", &min.to_string())
        .replace("{name}", name)
        .trim()
        .to_string();
    if fmt.contains("{name}") {
        out
    } else if out.is_empty() {
        name.to_string()
    } else {
        format!("{name} {out}").trim().to_string()
    }
}

fn base_name(node: &Node, opts: &NamingOptions) -> String {
    if opts.ip_rename
        && let Some(info) = &node.ip_info
    {
        let ip_name = format_ip_name(&opts.ip_name_fmt, info);
        if !ip_name.is_empty() {
            return ip_name;
        }
    }
    [&node.original_name, &node.host, &node.raw]
        .into_iter()
        .find(|s| !s.is_empty())
        .cloned()
        .unwrap_or_default()
}

/// Name and region for a node before any latency suffix.
pub fn compute_name_and_region(node: &Node, opts: &NamingOptions) -> (String, String) {
    let mut name = base_name(node, opts);
    let region = match_region(&name, &node.host, &opts.region_rules)
        .or_else(|| node.ip_info.as_ref().map(format_ip_region))
        .unwrap_or_default();
    if !opts.ip_rename || node.ip_info.is_none() {
        name = abbreviate_region(&name);
    }
    if opts.rename {
        name = format_name(
            &opts.rename_fmt,
            &region,
            &name,
            &node.host,
            &node.scheme,
            node.index,
        );
    }
    (name, region)
}

/// Full output name: base name, rename template, then latency suffix.
pub fn build_output_name(node: &Node, opts: &NamingOptions, result: Option<&TestResult>) -> String {
    let (mut name, _) = compute_name_and_region(node, opts);
    if opts.latency_name
        && let Some(result) = result
        && result.done
        && !result.latency_ms.is_empty()
    {
        name = apply_latency_name(&name, &opts.latency_fmt, result);
    }
    name
}

/// Writes the computed name and region back into every node.
pub fn apply_regions_and_names(nodes: &mut [Node], opts: &NamingOptions) {
    for node in nodes.iter_mut() {
        let (name, region) = compute_name_and_region(node, opts);
        node.name = name;
        node.region = region;
    }
}
