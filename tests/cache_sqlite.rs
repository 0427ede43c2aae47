use credence_harness::cache::{CachedSample, SampleCache, SampleCacheKey, SqliteSampleCache};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    hit_count: i64,
    probability: Option<f64>,
    refused: bool,
}

fn key(template_hash: &str, claim: &str, replicate: usize) -> SampleCacheKey {
    SampleCacheKey::new(
        "openai/gpt-5-mini",
        "probe_v2",
        template_hash,
        claim,
        replicate,
    )
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteSampleCache::new(&db_path).unwrap();

    let key = key("template_hash", "the sky is blue", 0);
    let value = CachedSample {
        probability: Some(0.87),
        refused: false,
    };

    cache.put(&key, &value).await.unwrap();

    let hit1 = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit1.probability, Some(0.87));
    assert!(!hit1.refused);

    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, key.key_hash);
    assert_eq!(rows[0].hit_count, 2);
    assert_eq!(rows[0].probability, Some(0.87));
    assert!(!rows[0].refused);
}

#[tokio::test]
async fn replicates_are_distinct_cache_entries() {
    let dir = tempdir().unwrap();
    let cache = SqliteSampleCache::new(dir.path().join("cache.sqlite")).unwrap();

    let first = key("template_hash", "water boils at 100C at sea level", 0);
    let second = key("template_hash", "water boils at 100C at sea level", 1);
    assert_ne!(first.key_hash, second.key_hash);

    cache
        .put(
            &first,
            &CachedSample {
                probability: Some(0.9),
                refused: false,
            },
        )
        .await
        .unwrap();

    assert!(cache.get(&first).await.unwrap().is_some());
    assert!(cache.get(&second).await.unwrap().is_none());
}

#[tokio::test]
async fn refusals_round_trip() {
    let dir = tempdir().unwrap();
    let cache = SqliteSampleCache::new(dir.path().join("cache.sqlite")).unwrap();

    let key = key("template_hash", "a blocked claim", 0);
    cache
        .put(
            &key,
            &CachedSample {
                probability: None,
                refused: true,
            },
        )
        .await
        .unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert!(hit.refused);
    assert_eq!(hit.probability, None);
}

#[tokio::test]
async fn prune_by_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let cache = SqliteSampleCache::new(dir.path().join("cache.sqlite")).unwrap();

    for replicate in 0..5 {
        cache
            .put(
                &key("template_hash", "claim", replicate),
                &CachedSample {
                    probability: Some(0.5),
                    refused: false,
                },
            )
            .await
            .unwrap();
    }

    let stats = cache.prune(None, Some(2)).await.unwrap();
    assert_eq!(stats.deleted, 3);
    assert_eq!(stats.remaining, 2);
}

#[tokio::test]
async fn different_claims_do_not_collide() {
    let a = key("template_hash", "claim one", 0);
    let b = key("template_hash", "claim two", 0);
    assert_ne!(a.claim_hash, b.claim_hash);
    assert_ne!(a.key_hash, b.key_hash);
}
