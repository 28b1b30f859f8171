//! PICS response handlers that turn package/app metadata into catalog
//! entries and the list of depot keys still to harvest.

use std::collections::BTreeSet;

use tracing::error;

use crate::catalog::Catalog;
use crate::cm::{AppEntry, AppRequest, CmError, EResult, PackageEntry, TokenEntry};
use crate::vdf;

/// IDs collected from an account's package info.
#[derive(Debug, Default, PartialEq)]
pub struct PackageScan {
    /// Depot IDs the account may own a license for. App IDs are included:
    /// an app ID may also denote a depot.
    pub candidate_depots: BTreeSet<u32>,
    /// App IDs to query app info for.
    pub owned_apps: BTreeSet<u32>,
}

/// Collect depot and app IDs from PICS package-info entries (binary VDF).
/// A failed entry aborts the cycle; malformed VDF just contributes nothing.
pub fn scan_packages(steam_id: u64, packages: &[PackageEntry]) -> Result<PackageScan, CmError> {
    for package in packages {
        if let Err(err) = &package.result {
            error!(
                "Failed to get PICS info for package {} owned by account {steam_id}: {err}",
                package.package_id
            );
            return Err(err.clone());
        }
    }
    let mut scan = PackageScan::default();
    for package in packages {
        let data = package.result.as_ref().expect("checked above");
        let node = vdf::parse_binary(data);
        if let Some(depot_ids) = node.child("depotids") {
            scan.candidate_depots
                .extend(depot_ids.int_attrs.values().map(|&id| id as u32));
        }
        if let Some(app_ids) = node.child("appids") {
            for &app_id in app_ids.int_attrs.values() {
                scan.owned_apps.insert(app_id as u32);
                scan.candidate_depots.insert(app_id as u32);
            }
        }
    }
    Ok(scan)
}

/// Fold access-token results into app-info requests. Apps denied a token
/// are kept with token 0; any other per-app failure aborts the cycle.
pub fn fold_access_tokens(
    steam_id: u64,
    entries: Vec<TokenEntry>,
) -> Result<Vec<AppRequest>, CmError> {
    let mut requests = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.result {
            Ok(token) => requests.push(AppRequest {
                app_id: entry.app_id,
                access_token: token,
            }),
            Err(CmError::Steam(EResult::AccessTokenDenied)) => requests.push(AppRequest {
                app_id: entry.app_id,
                access_token: 0,
            }),
            Err(err) => {
                error!(
                    "Failed to get PICS access token for app {} owned by account {steam_id}: {err}",
                    entry.app_id
                );
                return Err(err);
            }
        }
    }
    Ok(requests)
}

/// Admit the depots found in app-info entries (text VDF) into the catalog
/// and return the `(app_id, depot_id)` pairs whose decryption keys are
/// still missing, sorted and deduplicated.
///
/// Apps reported without an access token are skipped; any other per-app
/// failure aborts the cycle. The caller holds the catalog write guard.
pub fn apply_app_info(
    catalog: &mut Catalog,
    steam_id: u64,
    candidates: &mut BTreeSet<u32>,
    entries: &[AppEntry],
) -> Result<Vec<(u32, u32)>, CmError> {
    for entry in entries {
        match &entry.result {
            Ok(_) | Err(CmError::Steam(EResult::MissingToken)) => {}
            Err(err) => {
                error!(
                    "Could not get PICS info for app {} owned by account {steam_id}: {err}",
                    entry.app_id
                );
                return Err(err.clone());
            }
        }
    }
    let mut missing_keys = Vec::new();
    for entry in entries {
        let Ok(text) = &entry.result else {
            continue;
        };
        let doc = vdf::parse_text(text);
        let node = app_root(&doc);
        let Some(depots) = node.child("depots") else {
            continue;
        };
        let mut depot_ids = Vec::new();
        if let Some(workshop) = depots.attr("workshopdepot") {
            if let Ok(depot_id) = workshop.parse::<u32>() {
                depot_ids.push(depot_id);
            }
        }
        for (key, depot) in &depots.children {
            if depot.child("manifests").is_none() {
                continue;
            }
            let Ok(depot_id) = key.parse::<u32>() else {
                continue;
            };
            if candidates.remove(&depot_id) {
                depot_ids.push(depot_id);
            }
        }
        if depot_ids.is_empty() {
            continue;
        }
        let name = node
            .child("common")
            .and_then(|common| common.attr("name"));
        for &depot_id in &depot_ids {
            catalog.admit_depot(entry.app_id, depot_id, steam_id);
            if !catalog.has_key(depot_id) {
                missing_keys.push((entry.app_id, depot_id));
            }
        }
        catalog.set_app_meta(entry.app_id, name, entry.access_token);
    }
    candidates.clear();
    missing_keys.sort_unstable();
    missing_keys.dedup();
    Ok(missing_keys)
}

/// App-info documents come wrapped in a single `appinfo` root block;
/// tolerate both the wrapped and the bare shape.
fn app_root(doc: &vdf::TextNode) -> &vdf::TextNode {
    if doc.child("depots").is_some() || doc.child("common").is_some() {
        return doc;
    }
    if doc.attrs.is_empty() && doc.children.len() == 1 {
        return doc.children.values().next().expect("one child");
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AccountEntry;
    use crate::cm::AuthTokenInfo;

    fn package_vdf(depot_ids: &[i32], app_ids: &[i32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0x00);
        buf.extend(b"depotids\0");
        for (i, id) in depot_ids.iter().enumerate() {
            buf.push(0x02);
            buf.extend(i.to_string().as_bytes());
            buf.push(0);
            buf.extend(id.to_le_bytes());
        }
        buf.push(0x08);
        buf.push(0x00);
        buf.extend(b"appids\0");
        for (i, id) in app_ids.iter().enumerate() {
            buf.push(0x02);
            buf.extend(i.to_string().as_bytes());
            buf.push(0);
            buf.extend(id.to_le_bytes());
        }
        buf.push(0x08);
        buf
    }

    fn test_catalog(steam_id: u64) -> Catalog {
        let mut catalog = Catalog::new(None);
        catalog.insert_account(AccountEntry::new(
            "tok".into(),
            AuthTokenInfo {
                steam_id,
                renewable: true,
                expires: i64::MAX,
            },
        ));
        catalog
    }

    const APP_INFO: &str = r#"
        "appinfo"
        {
            "common"
            {
                "name"  "Team Fortress 2"
            }
            "depots"
            {
                "441"
                {
                    "manifests" { "public" "111" }
                }
                "442"
                {
                    "manifests" { "public" "222" }
                }
                "443"
                {
                    "config" { "oslist" "windows" }
                }
                "workshopdepot" "450"
            }
        }
    "#;

    #[test]
    fn scan_collects_depots_and_apps() {
        let packages = vec![PackageEntry {
            package_id: 100,
            result: Ok(package_vdf(&[441, 442], &[440])),
        }];
        let scan = scan_packages(1, &packages).unwrap();
        assert_eq!(scan.owned_apps, BTreeSet::from([440]));
        assert_eq!(scan.candidate_depots, BTreeSet::from([440, 441, 442]));
    }

    #[test]
    fn scan_aborts_on_failed_package() {
        let packages = vec![PackageEntry {
            package_id: 100,
            result: Err(CmError::Steam(EResult::Fail)),
        }];
        assert!(scan_packages(1, &packages).is_err());
    }

    #[test]
    fn denied_access_token_becomes_zero() {
        let requests = fold_access_tokens(
            1,
            vec![
                TokenEntry {
                    app_id: 440,
                    result: Ok(77),
                },
                TokenEntry {
                    app_id: 570,
                    result: Err(CmError::Steam(EResult::AccessTokenDenied)),
                },
            ],
        )
        .unwrap();
        assert_eq!(requests[0].access_token, 77);
        assert_eq!(requests[1].access_token, 0);
    }

    #[test]
    fn app_info_admits_candidate_depots_only() {
        let mut catalog = test_catalog(1);
        let mut candidates = BTreeSet::from([441, 442]);
        let entries = vec![AppEntry {
            app_id: 440,
            access_token: 9,
            result: Ok(APP_INFO.into()),
        }];
        let missing = apply_app_info(&mut catalog, 1, &mut candidates, &entries).unwrap();
        let app = &catalog.apps()[&440];
        assert_eq!(app.name, "Team Fortress 2");
        assert_eq!(app.pics_at, 9);
        // 443 has no manifests child, 450 is the workshop depot (admitted
        // without a candidate entry).
        assert_eq!(
            app.depots.keys().copied().collect::<Vec<_>>(),
            vec![441, 442, 450]
        );
        assert_eq!(missing, vec![(440, 441), (440, 442), (440, 450)]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn app_without_admitted_depots_is_skipped() {
        let mut catalog = test_catalog(1);
        let mut candidates = BTreeSet::new();
        let entries = vec![AppEntry {
            app_id: 480,
            access_token: 0,
            result: Ok("\"appinfo\" { \"depots\" { \"481\" { \"manifests\" { } } } }".into()),
        }];
        let missing = apply_app_info(&mut catalog, 1, &mut candidates, &entries).unwrap();
        assert!(missing.is_empty());
        assert!(catalog.apps().is_empty());
    }

    #[test]
    fn missing_token_entries_are_tolerated() {
        let mut catalog = test_catalog(1);
        let mut candidates = BTreeSet::from([441]);
        let entries = vec![
            AppEntry {
                app_id: 10,
                access_token: 0,
                result: Err(CmError::Steam(EResult::MissingToken)),
            },
            AppEntry {
                app_id: 440,
                access_token: 0,
                result: Ok(APP_INFO.into()),
            },
        ];
        let missing = apply_app_info(&mut catalog, 1, &mut candidates, &entries).unwrap();
        assert!(missing.contains(&(440, 441)));
    }

    #[test]
    fn known_keys_are_not_requested_again() {
        let mut catalog = test_catalog(1);
        catalog.insert_key(441, [1; 32]);
        let mut candidates = BTreeSet::from([441, 442]);
        let entries = vec![AppEntry {
            app_id: 440,
            access_token: 0,
            result: Ok(APP_INFO.into()),
        }];
        let missing = apply_app_info(&mut catalog, 1, &mut candidates, &entries).unwrap();
        assert_eq!(missing, vec![(440, 442), (440, 450)]);
    }
}
