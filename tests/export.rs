use nodeprobe::builder::{ExportFormat, NamingOptions, RegionRule, render};
use nodeprobe::model::TestResult;
use nodeprobe::parser::parse_nodes_from_text;
use serde_yaml::Value;

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn passed(ms: u64) -> TestResult {
    TestResult {
        done: true,
        pass: true,
        latency_ms: vec![ms, ms],
        avg_ms: ms,
        max_ms: ms,
        attempts: 2,
        successful: 2,
        ..Default::default()
    }
}

fn subscription() -> String {
    format!(
        "trojan://pw@hk.example.com:443#Hong%20Kong%2001\n\
         vless://{UUID}@jp.example.com:443?security=tls&sni=jp.example.com&type=ws&path=%2Fws#Japan%2002\n\
         trojan://pw@dead.example.com:443#Dead"
    )
}

#[test]
fn test_yaml_export_contains_only_passing_nodes() {
    let nodes = parse_nodes_from_text(&subscription()).unwrap().nodes;
    let results = vec![passed(80), passed(120), TestResult::failed("timeout", 1)];
    let opts = NamingOptions {
        latency_name: true,
        ..Default::default()
    };

    let text = render(ExportFormat::Yaml, None, &nodes, &results, &opts, &[]).unwrap();
    assert!(text.starts_with("# generated by nodeprobe"));
    let doc: Value = serde_yaml::from_str(&text).unwrap();

    let proxies = doc["proxies"].as_sequence().unwrap();
    let names: Vec<&str> = proxies.iter().map(|p| p["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["HK 01 80ms", "JP 02 120ms"]);
    assert_eq!(proxies[1]["type"], Value::from("vless"));
    assert_eq!(proxies[1]["network"], Value::from("ws"));

    let group = &doc["proxy-groups"][0];
    assert_eq!(group["name"], Value::from("AUTO"));
    let members: Vec<&str> = group["proxies"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(members, names);
}

#[test]
fn test_template_groups_are_refreshed() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("template.yaml");
    std::fs::write(
        &template,
        "mixed-port: 7890\n\
         proxies:\n  - {name: old-1, type: ss, server: o.example.com, port: 1, cipher: aes-128-gcm, password: x}\n\
         proxy-groups:\n  - {name: Proxy, type: select, proxies: [DIRECT, old-1]}\n  - {name: Media, type: select, proxies: [DIRECT]}\n\
         rules:\n  - MATCH,Proxy\n",
    )
    .unwrap();

    let nodes = parse_nodes_from_text(&subscription()).unwrap().nodes;
    let text = render(
        ExportFormat::Yaml,
        Some(&template),
        &nodes,
        &[],
        &NamingOptions::default(),
        &[],
    )
    .unwrap();
    let doc: Value = serde_yaml::from_str(&text).unwrap();

    assert_eq!(doc["proxies"].as_sequence().unwrap().len(), 3);
    let proxy_group: Vec<&str> = doc["proxy-groups"][0]["proxies"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(proxy_group, vec!["DIRECT", "HK 01", "JP 02", "Dead"]);
    assert_eq!(doc["proxy-groups"][1]["proxies"].as_sequence().unwrap().len(), 1);
    assert_eq!(doc["rules"][0], Value::from("MATCH,Proxy"));
}

#[test]
fn test_uri_export_applies_rename_rules() {
    let nodes = parse_nodes_from_text(&subscription()).unwrap().nodes;
    let opts = NamingOptions {
        rename: true,
        rename_fmt: "{region}-{index}".into(),
        region_rules: vec![RegionRule {
            pattern: "japan".into(),
            region: "JP".into(),
        }],
        ..Default::default()
    };
    let results = vec![TestResult::failed("timeout", 3), passed(60), TestResult::failed("timeout", 3)];
    let text = render(ExportFormat::Uri, None, &nodes, &results, &opts, &[]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with(&format!("vless://{UUID}@jp.example.com:443?")));
    assert!(lines[0].ends_with("#JP-2"));
}

#[test]
fn test_nothing_to_export_is_an_error() {
    let nodes = parse_nodes_from_text(&subscription()).unwrap().nodes;
    let results = vec![TestResult::failed("timeout", 1); 3];
    for format in [ExportFormat::Yaml, ExportFormat::Flow, ExportFormat::Uri] {
        assert!(render(format, None, &nodes, &results, &NamingOptions::default(), &[]).is_err());
    }
}
