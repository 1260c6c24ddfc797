use serde_json::{json, Value};

/// Fields with an explicit type in every event partition.
pub const MAPPED_FIELDS: &[&str] = &[
    "timestamp",
    "received_at",
    "event_id",
    "source",
    "threat_type",
    "threat_type_ru",
    "severity",
    "severity_ru",
    "description",
    "metadata",
    "cve_id",
    "cvss_score",
    "malware_family",
    "file_hash",
    "source_ip",
    "target_port",
    "processed_at",
    "processed_by",
];

/// Settings applied when a partition is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    pub shards: u32,
    pub replicas: u32,
    pub refresh_interval: String,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            shards: 1,
            replicas: 0,
            refresh_interval: "5s".to_owned(),
        }
    }
}

/// Body of the create-index request: settings plus the fixed field mapping.
pub fn index_body(settings: &IndexSettings) -> Value {
    json!({
        "settings": {
            "number_of_shards": settings.shards,
            "number_of_replicas": settings.replicas,
            "index": {
                "refresh_interval": settings.refresh_interval
            }
        },
        "mappings": {
            "properties": {
                "timestamp": {"type": "date"},
                "received_at": {"type": "date"},
                "event_id": {"type": "keyword"},
                "source": {"type": "keyword"},
                "threat_type": {"type": "keyword"},
                "threat_type_ru": {"type": "keyword"},
                "severity": {"type": "keyword"},
                "severity_ru": {"type": "keyword"},
                "description": {
                    "type": "text",
                    "analyzer": "standard",
                    "fields": {
                        "keyword": {"type": "keyword", "ignore_above": 256}
                    }
                },
                "metadata": {"type": "object", "dynamic": true},
                "cve_id": {"type": "keyword"},
                "cvss_score": {"type": "float"},
                "malware_family": {"type": "keyword"},
                "file_hash": {"type": "keyword"},
                "source_ip": {"type": "ip"},
                "target_port": {"type": "integer"},
                "processed_at": {"type": "date"},
                "processed_by": {"type": "keyword"}
            }
        }
    })
}
