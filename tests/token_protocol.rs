//! Update token issue/apply against containers on disk

use chrono::{Duration, Utc};
use proptest::prelude::*;
use sma_rs::core::io::read_container;
use sma_rs::core::token::TokenPayload;
use sma_rs::{
    ActorDataService, LocalFileCache, OwnerKeyPair, Rejection, SmaConfig, SmaFile, SmaKind,
    TokenOutcome, UpdateToken,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const PASSWORD: &str = "pw";

struct Fixture {
    dir: TempDir,
    owner: OwnerKeyPair,
    service: ActorDataService,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let owner = OwnerKeyPair::generate();
        let service = ActorDataService::new(
            Arc::new(LocalFileCache::open(dir.path().join("cache")).unwrap()),
            Arc::new(owner.clone()),
            SmaConfig::fast_kdf(),
        )
        .unwrap();
        Fixture { dir, owner, service }
    }

    fn export(&self, name: &str, allowed: &[&str]) -> PathBuf {
        let path = self.dir.path().join(name);
        self.service
            .export(SmaKind::Base)
            .name(name)
            .add_bytes(name.as_bytes().to_vec(), vec!["chara/common/texture/x.tex".into()])
            .allow_all(allowed.iter().copied())
            .write(&path, PASSWORD)
            .unwrap();
        path
    }

    fn file_id(&self, path: &PathBuf) -> Uuid {
        self.service.inspect(path).unwrap().file_id
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_apply_amends_and_file_still_opens() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &["p1", "p2"]);

    let token = fx
        .service
        .issue_token(&path, strings(&["p3"]), strings(&["p1"]))
        .unwrap();
    let outcome = fx.service.apply_token(&path, &token, PASSWORD).unwrap();
    assert_eq!(outcome, TokenOutcome::Updated(strings(&["p2", "p3"])));

    let opened = SmaFile::detect(&path)
        .unwrap()
        .try_open(PASSWORD, fx.service.config())
        .unwrap();
    assert_eq!(opened.header().allowed_hashes, strings(&["p2", "p3"]));
}

#[test]
fn test_tokens_cannot_add_ambiguous_entries() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &["p1"]);
    let before = std::fs::read(&path).unwrap();

    assert!(matches!(
        fx.service.issue_token(&path, strings(&["p2,p3"]), vec![]),
        Err(sma_rs::SmaError::Malformed(_))
    ));

    let token = UpdateToken::issue(
        &fx.owner,
        fx.file_id(&path),
        strings(&[""]),
        vec![],
        Duration::minutes(5),
    );
    assert!(matches!(
        fx.service.apply_token(&path, &token, PASSWORD),
        Err(sma_rs::SmaError::Malformed(_))
    ));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_second_application_is_a_noop() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &["p1"]);
    let token = fx.service.issue_token(&path, strings(&["p2"]), vec![]).unwrap();

    fx.service.apply_token(&path, &token, PASSWORD).unwrap();
    let after_first = std::fs::read(&path).unwrap();

    assert_eq!(
        fx.service.apply_token(&path, &token, PASSWORD).unwrap(),
        TokenOutcome::Unchanged
    );
    assert_eq!(std::fs::read(&path).unwrap(), after_first);
}

#[test]
fn test_token_for_other_file_is_refused() {
    let fx = Fixture::new();
    let a = fx.export("a.smab", &[]);
    let b = fx.export("b.smab", &[]);
    let before = std::fs::read(&b).unwrap();

    let token = fx.service.issue_token(&a, strings(&["x"]), vec![]).unwrap();
    let err = fx.service.apply_token(&b, &token, PASSWORD).unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::WrongFile));
    assert_eq!(std::fs::read(&b).unwrap(), before);
}

#[test]
fn test_expired_token_is_refused() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &[]);
    let token = UpdateToken::issue_until(
        &fx.owner,
        fx.file_id(&path),
        strings(&["x"]),
        vec![],
        Utc::now() - Duration::seconds(1),
    );

    let err = fx.service.apply_token(&path, &token, PASSWORD).unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::Expired));
}

#[test]
fn test_forged_and_tampered_tokens_are_refused() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &["p1"]);
    let before = std::fs::read(&path).unwrap();

    let forger = OwnerKeyPair::generate();
    let forged = UpdateToken::issue(&forger, fx.file_id(&path), strings(&["evil"]), vec![], Duration::hours(1));
    let err = fx.service.apply_token(&path, &forged, PASSWORD).unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::BadSignature));

    let mut tampered = fx.service.issue_token(&path, strings(&["ok"]), vec![]).unwrap();
    tampered.payload.add_hashes.push("evil".into());
    let err = fx.service.apply_token(&path, &tampered, PASSWORD).unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::BadSignature));

    let mut extended = fx.service.issue_token(&path, strings(&["ok"]), vec![]).unwrap();
    extended.payload.expires_utc_ticks += 1;
    let err = fx.service.apply_token(&path, &extended, PASSWORD).unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::BadSignature));

    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_application_needs_the_password() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &[]);
    let before = std::fs::read(&path).unwrap();

    let token = fx.service.issue_token(&path, strings(&["x"]), vec![]).unwrap();
    let err = fx.service.apply_token(&path, &token, "nope").unwrap_err();
    assert_eq!(err.rejection(), Some(Rejection::BadPassword));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_token_survives_json_file() {
    let fx = Fixture::new();
    let path = fx.export("a.smab", &[]);
    let token_path = fx.dir.path().join("grant.json");

    fx.service
        .issue_token(&path, strings(&["peer"]), vec![])
        .unwrap()
        .save(&token_path)
        .unwrap();
    let token = UpdateToken::load(&token_path).unwrap();

    fx.service.apply_token(&path, &token, PASSWORD).unwrap();
    let raw = read_container(&path, SmaKind::Base).unwrap();
    assert_eq!(raw.header.allowed_hashes, strings(&["peer"]));
}

fn hash_list() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-f0-9]{1,4}", 0..6)
}

proptest! {
    #[test]
    fn prop_amend_is_idempotent_and_duplicate_free(
        old in hash_list(),
        add in hash_list(),
        remove in hash_list(),
    ) {
        let payload = TokenPayload {
            file_id: Uuid::nil(),
            add_hashes: add.clone(),
            remove_hashes: remove.clone(),
            expires_utc_ticks: 0,
            nonce: vec![],
        };
        let once = payload.amend(&old);
        prop_assert_eq!(payload.amend(&once), once.clone());

        for hash in &once {
            prop_assert!(!remove.contains(hash));
            prop_assert!(old.contains(hash) || add.contains(hash));
            prop_assert_eq!(once.iter().filter(|h| *h == hash).count(), 1);
        }
        for hash in add.iter().filter(|h| !remove.contains(h)) {
            prop_assert!(once.contains(hash));
        }
    }

    #[test]
    fn prop_canonical_bytes_cover_every_field(
        add in hash_list(),
        ticks in any::<i64>(),
        nonce in prop::collection::vec(any::<u8>(), 0..20),
    ) {
        let payload = TokenPayload {
            file_id: Uuid::nil(),
            add_hashes: add,
            remove_hashes: vec![],
            expires_utc_ticks: ticks,
            nonce,
        };
        let mut changed = payload.clone();
        changed.expires_utc_ticks = ticks.wrapping_add(1);
        prop_assert_ne!(payload.canonical_bytes(), changed.canonical_bytes());

        let mut moved = payload.clone();
        moved.remove_hashes = moved.add_hashes.drain(..).collect();
        if !moved.remove_hashes.is_empty() {
            prop_assert_ne!(payload.canonical_bytes(), moved.canonical_bytes());
        }
    }
}
