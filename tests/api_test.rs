//! Integration tests for the public API

use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use openssl::asn1::Asn1Time;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use certexporter::config::{Cli, Config, ScrapeConfiguration};
use certexporter::metrics::{render, CertificateCollector, MetricSchema};
use certexporter::scraper::Scraper;
use certexporter::source::{ListRequest, SecretPage, SecretSource};
use certexporter::{ListingError, ScrapeError};

fn certificate(common_name: &str, organization: &str, unit: &str, not_after: i64) -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)
        .unwrap();
    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, unit)
        .unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(1_700_000_000).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build().to_pem().unwrap()
}

fn private_key() -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    key.private_key_to_pem_pkcs8().unwrap()
}

fn tls_secret(cert: Vec<u8>) -> Secret {
    let mut data = BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(cert));
    data.insert("tls.key".to_string(), ByteString(private_key()));
    Secret {
        data: Some(data),
        ..Secret::default()
    }
}

fn opaque_secret(values: &[(&str, &[u8])]) -> Secret {
    let data = values
        .iter()
        .map(|(key, value)| (key.to_string(), ByteString(value.to_vec())))
        .collect();
    Secret {
        data: Some(data),
        ..Secret::default()
    }
}

/// In-memory secret store serving each namespace in pages of `request.limit`.
///
/// The empty namespace is served from `default`.
#[derive(Default)]
struct FakeSecretSource {
    namespaces: HashMap<String, Vec<Secret>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<(String, ListRequest)>>,
}

impl FakeSecretSource {
    fn with_namespace(mut self, namespace: &str, secrets: Vec<Secret>) -> Self {
        self.namespaces.insert(namespace.to_string(), secrets);
        self
    }

    fn failing_in(mut self, namespace: &str) -> Self {
        self.failing.insert(namespace.to_string());
        self
    }

    fn calls(&self) -> Vec<(String, ListRequest)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretSource for FakeSecretSource {
    async fn list_secrets(
        &self,
        namespace: &str,
        request: &ListRequest,
    ) -> Result<SecretPage, ListingError> {
        self.calls
            .lock()
            .unwrap()
            .push((namespace.to_string(), request.clone()));

        if self.failing.contains(namespace) {
            return Err(ListingError::Other {
                namespace: namespace.to_string(),
                message: "secrets is forbidden".to_string(),
                transient: false,
            });
        }

        let resolved = if namespace.is_empty() {
            "default"
        } else {
            namespace
        };
        let secrets = self.namespaces.get(resolved).cloned().unwrap_or_default();
        let start: usize = request
            .continue_token
            .as_deref()
            .map(|token| token.parse().unwrap())
            .unwrap_or(0);
        let end = (start + request.limit as usize).min(secrets.len());

        Ok(SecretPage {
            secrets: secrets[start..end].to_vec(),
            continue_token: (end < secrets.len()).then(|| end.to_string()),
        })
    }
}

fn collector<S: SecretSource>(
    config: ScrapeConfiguration,
    source: Arc<S>,
) -> CertificateCollector<S> {
    CertificateCollector::new(
        MetricSchema::new("hlf").unwrap(),
        Scraper::new(config, source),
    )
}

fn sample_lines<'a>(text: &'a str, metric: &str) -> Vec<&'a str> {
    let prefix = format!("{}{{", metric);
    text.lines()
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

#[tokio::test]
async fn test_scrape_aggregates_valid_entries_across_namespaces() {
    let source = Arc::new(
        FakeSecretSource::default()
            .with_namespace(
                "org1",
                vec![
                    tls_secret(certificate("peer0.org1", "Org1", "peer", 1_800_000_000)),
                    tls_secret(certificate("peer1.org1", "Org1", "peer", 1_800_000_100)),
                    opaque_secret(&[("password", b"hunter2".as_slice())]),
                ],
            )
            .with_namespace(
                "org2",
                vec![opaque_secret(&[
                    (
                        "ca.crt",
                        certificate("ca.org2", "Org2", "ca", 1_900_000_000).as_slice(),
                    ),
                    (
                        "garbage",
                        b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".as_slice(),
                    ),
                    (
                        "admin.crt",
                        certificate("admin.org2", "Org2", "admin", 1_850_000_000).as_slice(),
                    ),
                ])],
            ),
    );
    let mut config = ScrapeConfiguration::new(vec!["org1".to_string(), "org2".to_string()], "");
    config.page_limit = 2;
    let collector = collector(config, source.clone());

    let text = render(&collector.collect().await.unwrap()).unwrap();

    let not_after = sample_lines(&text, "hlf_cert_not_after");
    let not_before = sample_lines(&text, "hlf_cert_not_before");
    assert_eq!(not_after.len(), 4);
    assert_eq!(not_before.len(), 4);
    assert!(text.contains(r#"hlf_cert_not_after{cn="peer0.org1",o="Org1",ou="peer"} 1800000000"#));
    assert!(text.contains(r#"hlf_cert_not_after{cn="ca.org2",o="Org2",ou="ca"} 1900000000"#));
    assert!(text.contains(r#"hlf_cert_not_before{cn="admin.org2",o="Org2",ou="admin"} 1700000000"#));

    // org1 holds three secrets and is drained in two pages of two.
    let calls = source.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].0, "org1");
    assert_eq!(calls[0].1.limit, 2);
    assert_eq!(calls[1].1.continue_token.as_deref(), Some("2"));
    assert_eq!(calls[2].0, "org2");
}

#[tokio::test]
async fn test_label_collision_last_write_wins() {
    let source = Arc::new(FakeSecretSource::default().with_namespace(
        "org1",
        vec![
            tls_secret(certificate("peer0", "Org1", "peer", 1_800_000_000)),
            tls_secret(certificate("peer0", "Org1", "peer", 1_850_000_000)),
        ],
    ));
    let collector = collector(
        ScrapeConfiguration::new(vec!["org1".to_string()], ""),
        source,
    );

    let text = render(&collector.collect().await.unwrap()).unwrap();

    assert_eq!(
        sample_lines(&text, "hlf_cert_not_after"),
        vec![r#"hlf_cert_not_after{cn="peer0",o="Org1",ou="peer"} 1850000000"#]
    );
    assert_eq!(sample_lines(&text, "hlf_cert_not_before").len(), 1);
}

#[tokio::test]
async fn test_duplicate_namespaces_are_processed_independently() {
    let source = Arc::new(FakeSecretSource::default().with_namespace(
        "org1",
        vec![tls_secret(certificate("peer0", "Org1", "peer", 1_800_000_000))],
    ));
    let collector = collector(
        ScrapeConfiguration::new(vec!["org1".to_string(), "org1".to_string()], ""),
        source.clone(),
    );

    let text = render(&collector.collect().await.unwrap()).unwrap();

    assert_eq!(source.calls().len(), 2);
    assert_eq!(sample_lines(&text, "hlf_cert_not_after").len(), 1);
}

#[tokio::test]
async fn test_empty_namespace_selector_scrapes_default_namespace() {
    let source = Arc::new(
        FakeSecretSource::default()
            .with_namespace(
                "default",
                vec![tls_secret(certificate("orderer0", "OrdererOrg", "orderer", 1_800_000_000))],
            )
            .with_namespace(
                "org1",
                vec![tls_secret(certificate("peer0", "Org1", "peer", 1_800_000_000))],
            ),
    );
    let cli = Cli::parse_from(["certexporter", "--ns", "", "--label", "app=orderer"]);
    let settings = Config::from_cli_args(&cli).resolve().unwrap();
    assert_eq!(settings.scrape.namespaces, vec![String::new()]);
    let collector = collector(settings.scrape, source.clone());

    let text = render(&collector.collect().await.unwrap()).unwrap();

    assert!(text.contains(r#"cn="orderer0""#));
    assert!(!text.contains(r#"cn="peer0""#));
    let calls = source.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "");
    assert_eq!(calls[0].1.label_selector, "app=orderer");
    assert_eq!(calls[0].1.limit, 200);
}

#[tokio::test]
async fn test_listing_failure_fails_whole_scrape() {
    let source = Arc::new(
        FakeSecretSource::default()
            .with_namespace(
                "org1",
                vec![tls_secret(certificate("peer0", "Org1", "peer", 1_800_000_000))],
            )
            .failing_in("org2"),
    );
    let collector = collector(
        ScrapeConfiguration::new(
            vec!["org1".to_string(), "org2".to_string(), "org3".to_string()],
            "",
        ),
        source.clone(),
    );

    match collector.collect().await {
        Err(ScrapeError::Listing(err)) => {
            assert_eq!(err.namespace(), "org2");
            assert!(!err.is_transient());
        }
        other => panic!("Expected listing error, got {:?}", other),
    }
    // org3 is never listed once org2 fails.
    assert_eq!(source.calls().len(), 2);
}

#[tokio::test]
async fn test_describe_is_independent_of_scrapes() {
    let source = Arc::new(FakeSecretSource::default().failing_in("org1"));
    let collector = collector(
        ScrapeConfiguration::new(vec!["org1".to_string()], ""),
        source.clone(),
    );

    let descs = collector.describe();

    assert_eq!(descs.len(), 2);
    assert_eq!(descs[0].fq_name, "hlf_cert_not_after");
    assert_eq!(descs[1].fq_name, "hlf_cert_not_before");
    for desc in descs {
        assert_eq!(desc.variable_labels, vec!["cn", "o", "ou"]);
    }
    assert!(source.calls().is_empty());
}

/// Serves a different certificate on every listing call.
struct RotatingSource {
    certificates: Vec<Vec<u8>>,
    next: AtomicUsize,
}

#[async_trait]
impl SecretSource for RotatingSource {
    async fn list_secrets(
        &self,
        _namespace: &str,
        _request: &ListRequest,
    ) -> Result<SecretPage, ListingError> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(SecretPage {
            secrets: vec![tls_secret(self.certificates[index].clone())],
            continue_token: None,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_collects_are_isolated() {
    const SCRAPES: usize = 8;
    let certificates = (0..SCRAPES)
        .map(|i| certificate(&format!("scrape-{}", i), "Org1", "peer", 1_800_000_000 + i as i64))
        .collect();
    let source = Arc::new(RotatingSource {
        certificates,
        next: AtomicUsize::new(0),
    });
    let collector = Arc::new(collector(
        ScrapeConfiguration::new(vec!["org1".to_string()], ""),
        source,
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..SCRAPES {
        let collector = collector.clone();
        tasks.spawn(async move { render(&collector.collect().await.unwrap()).unwrap() });
    }

    let mut seen = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let text = result.unwrap();
        let not_after = sample_lines(&text, "hlf_cert_not_after");
        let not_before = sample_lines(&text, "hlf_cert_not_before");
        assert_eq!(not_after.len(), 1, "unexpected samples in {}", text);
        assert_eq!(not_before.len(), 1, "unexpected samples in {}", text);

        let cn = not_after[0]
            .split('"')
            .nth(1)
            .unwrap()
            .to_string();
        let index: i64 = cn.trim_start_matches("scrape-").parse().unwrap();
        assert!(not_after[0].ends_with(&format!(" {}", 1_800_000_000 + index)));
        assert!(not_before[0].contains(&format!(r#"cn="{}""#, cn)));
        assert!(seen.insert(cn));
    }
    assert_eq!(seen.len(), SCRAPES);
}

#[test]
fn test_parse_error_types_are_public() {
    fn handle_error(err: certexporter::ParseError) -> String {
        match err {
            certexporter::ParseError::InvalidPem => "invalid pem".to_string(),
            certexporter::ParseError::InvalidCertificate { reason } => reason,
        }
    }

    assert_eq!(
        handle_error(certexporter::parse(b"tls.key").unwrap_err()),
        "invalid pem"
    );
}
