use nodeprobe::builder::{dedup_nodes, node_to_record};
use nodeprobe::model::Security;
use nodeprobe::parser::b64::{RAW_STD, RAW_URL, STD, URL};
use nodeprobe::parser::reality::normalize_public_key;
use nodeprobe::parser::uuid::normalize_uuid;
use nodeprobe::parser::{parse_node, parse_nodes_from_text};
use nodeprobe::ParseError;

use base64::Engine;

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";
// 32 bytes whose standard encoding starts with a literal '+'.
const PBK_STD: &str = "+/v7AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxw=";
const PBK_CANONICAL: &str = "-_v7AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxw";

#[test]
fn test_uuid_normalization_is_idempotent() {
    assert_eq!(normalize_uuid(UUID).unwrap(), UUID);
    let compact = UUID.replace('-', "").to_uppercase();
    assert_eq!(normalize_uuid(&compact).unwrap(), UUID);
    let once = normalize_uuid(&format!("{{{}}}", UUID.to_uppercase())).unwrap();
    assert_eq!(normalize_uuid(&once).unwrap(), once);
}

#[test]
fn test_reality_key_round_trip_all_variants() {
    for _ in 0..256 {
        let bytes: [u8; 32] = rand::random();
        let canonical = RAW_URL.encode(&bytes);
        for encoded in [
            STD.encode(&bytes),
            RAW_STD.encode(&bytes),
            URL.encode(&bytes),
            RAW_URL.encode(&bytes),
        ] {
            let normalized = normalize_public_key(&encoded).unwrap();
            assert_eq!(normalized, canonical);
            assert_eq!(RAW_URL.decode(&normalized).unwrap(), bytes);
        }
    }
}

#[test]
fn test_query_plus_is_preserved() {
    let uri = format!(
        "vless://{UUID}@r.example.com:443?security=reality&pbk={PBK_STD}&sni=example.com#MyNode"
    );
    let node = parse_node(&uri).unwrap();
    assert_eq!(node.params.get("pbk"), Some(PBK_STD));
    assert_eq!(normalize_public_key(node.params.get("pbk").unwrap()).unwrap(), PBK_CANONICAL);
}

#[test]
fn test_reality_vless_scenario() {
    let uri = format!(
        "vless://{UUID}@host.example.com:443?security=reality&pbk={PBK_STD}&sni=example.com#MyNode"
    );
    let node = parse_node(&uri).unwrap();
    assert_eq!(node.scheme, "vless");
    assert_eq!(node.security, Security::Reality);
    assert_eq!(node.name, "MyNode");

    let record = node_to_record(&node, "MyNode").unwrap();
    let reality = record.sub_record("reality-opts").unwrap();
    assert_eq!(reality.str("public-key"), PBK_CANONICAL);
    assert_eq!(record.bool("tls"), Some(true));
    assert_eq!(record.str("servername"), "example.com");
}

#[test]
fn test_bad_ss_line_is_a_warning_unless_alone() {
    match parse_nodes_from_text("ss://not-base64-and-no-at@") {
        Err(ParseError::NoNodes(warnings)) => assert_eq!(warnings.len(), 1),
        other => panic!("expected a run-level error, got {other:?}"),
    }

    let out = parse_nodes_from_text("ss://not-base64-and-no-at@\ntrojan://pw@t.example.com:443#T").unwrap();
    assert_eq!(out.nodes.len(), 1);
    assert_eq!(out.warnings.len(), 1);
    assert!(out.warnings[0].starts_with("line 1:"));
}

#[test]
fn test_dedup_keeps_one_per_endpoint() {
    let text = "trojan://pw@a.example.com:443#one\n\
                trojan://other@A.EXAMPLE.COM:443#two\n\
                trojan://pw@a.example.com:8443#three\n\
                vless://b831381d-6324-4d53-ad4f-8cda48b30811@a.example.com:443#four\n\
                trojan://pw@a.example.com:443#five";
    let nodes = parse_nodes_from_text(text).unwrap().nodes;
    assert_eq!(nodes.len(), 5);

    let kept = dedup_nodes(nodes);
    let names: Vec<&str> = kept.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["one", "three", "four"]);
    let indices: Vec<usize> = kept.iter().map(|n| n.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
}
