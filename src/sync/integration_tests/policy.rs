//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use super::defs::*;
use crate::store::tree::hash_reader;
use crate::support::chronox::now_seconds_ms;
use crate::support::file_ops;

#[test]
fn later_timestamp_wins() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"older", 1_600_000_000);
    b.put("INBOX/cur/x", b"newer!", 1_600_000_100);
    a.put("INBOX/cur/y", b"newer", 1_600_000_100);
    b.put("INBOX/cur/y", b"old", 1_600_000_000);

    let report = a.sync(&b, Direction::Both);
    assert_eq!(1, report.pulled);
    assert_eq!(1, report.pushed);
    assert_eq!(0, report.conflicts);
    assert_eq!(Some(b"newer!".to_vec()), a.read("INBOX/cur/x"));
    assert_eq!(Some(b"newer".to_vec()), b.read("INBOX/cur/y"));
    assert_eq!(1_600_000_100, a.mtime("INBOX/cur/x"));
    assert_eq!(1_600_000_100, b.mtime("INBOX/cur/y"));
}

/// Put `left` on one node and `right` on the other with the same timestamp
/// and check that the same version wins whichever side drives the pass.
fn settle_tie(left: &[u8], right: &[u8]) {
    let winner = if hash_reader(io::Cursor::new(left)).unwrap()
        > hash_reader(io::Cursor::new(right)).unwrap()
    {
        left
    } else {
        right
    };

    for &drive_from_a in &[true, false] {
        let a = node("a");
        let b = node("b");
        a.put("INBOX/cur/x", left, 1_600_000_000);
        b.put("INBOX/cur/x", right, 1_600_000_000);

        let report = if drive_from_a {
            a.sync(&b, Direction::Both)
        } else {
            b.sync(&a, Direction::Both)
        };
        assert_eq!(1, report.conflicts);
        assert_eq!(1, report.pushed + report.pulled);
        assert_eq!(Some(winner.to_vec()), a.read("INBOX/cur/x"));
        assert_eq!(Some(winner.to_vec()), b.read("INBOX/cur/x"));
        assert_eq!(1_600_000_000, a.mtime("INBOX/cur/x"));
        assert_eq!(1_600_000_000, b.mtime("INBOX/cur/x"));

        let report = a.sync(&b, Direction::Both);
        assert!(report.is_noop(), "{}", report);
        assert_eq!(0, report.conflicts);
    }
}

#[test]
fn equal_timestamp_conflicts_are_deterministic() {
    settle_tie(b"one version", b"another, longer version");
}

#[test]
fn equal_length_conflicts_are_not_mistaken_for_agreement() {
    settle_tie(b"AAAA", b"BBBB");
}

#[test]
fn identical_ties_are_left_alone() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"same", 1_600_000_000);
    b.put("INBOX/cur/x", b"same", 1_600_000_000);

    let report = a.sync(&b, Direction::Both);
    assert!(report.is_noop(), "{}", report);
    assert_eq!(0, report.conflicts);
    assert_eq!(0, report.skipped);
}

#[test]
fn deletions_and_resurrections() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"x", 1_600_000_000);
    a.put("INBOX/cur/y", b"y", 1_600_000_000);
    a.sync(&b, Direction::Both);

    a.remove("INBOX/cur/x");
    a.remove("INBOX/cur/y");
    // Modified on B after A deleted it
    b.put("INBOX/cur/y", b"y, edited", now_seconds_ms() / 1000 + 3600);

    let report = a.sync(&b, Direction::Both);
    assert_eq!(1, report.deleted_remote);
    assert_eq!(1, report.pulled);
    assert_eq!(None, b.read("INBOX/cur/x"));
    assert_eq!(Some(b"y, edited".to_vec()), a.read("INBOX/cur/y"));

    let report = b.sync(&a, Direction::Both);
    assert!(report.is_noop(), "{}", report);
}

#[test]
fn directory_removal_and_recreation() {
    let a = node("a");
    let b = node("b");
    a.put("Trash/cur/x", b"x", 1_600_000_000);
    a.sync(&b, Direction::Both);
    assert!(b.dirs().contains("Trash/cur"));

    a.remove_dir("Trash");
    let report = a.sync(&b, Direction::Both);
    assert_eq!(1, report.dirs_removed_remote);
    assert!(!b.dirs().contains("Trash"));
    assert!(b.contents().is_empty());

    let report = a.sync(&b, Direction::Both);
    assert!(report.is_noop(), "{}", report);

    // Created again on B later than the removal
    b.put("Trash/cur/z", b"z", 1_600_000_000);
    let future = now_seconds_ms() + 3_600_000;
    file_ops::set_mtime(b.root().join("Trash"), future).unwrap();
    let report = b.sync(&a, Direction::Both);
    assert_eq!(2, report.dirs_created_remote);
    assert_eq!(1, report.pushed);
    assert_eq!(Some(b"z".to_vec()), a.read("Trash/cur/z"));
}

#[test]
fn directions_are_honoured() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"x", 1_600_000_000);
    b.put("INBOX/cur/y", b"y", 1_600_000_000);
    b.put("Archive/cur/z", b"z", 1_600_000_000);

    let report = a.sync(&b, Direction::Push);
    assert_eq!(1, report.pushed);
    assert_eq!(0, report.pulled);
    assert_eq!(0, report.dirs_created_local);
    assert_eq!(None, a.read("INBOX/cur/y"));
    assert!(!a.dirs().contains("Archive"));
    assert_eq!(Some(b"x".to_vec()), b.read("INBOX/cur/x"));

    // Push never deletes locally, even when the peer has deleted
    b.remove("INBOX/cur/x");
    let report = a.sync(&b, Direction::Push);
    assert_eq!(0, report.deleted_local);
    assert_eq!(Some(b"x".to_vec()), a.read("INBOX/cur/x"));

    // Watermarks are per peer name, and the push-only passes above never
    // looked at what the peer changed, so pulling needs a fresh name.
    let puller = PeerConfig {
        name: "b-pull".to_owned(),
        ..b.peer(Direction::Pull)
    };
    let report = a.try_sync(&b, &puller).unwrap();
    assert_eq!(0, report.pushed);
    assert_eq!(1, report.deleted_local);
    assert_eq!(2, report.pulled);
    assert_eq!(b.contents(), a.contents());
}

#[test]
fn scope_limits_what_is_touched() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"x", 1_600_000_000);
    a.put("INBOX/.Sub/cur/s", b"s", 1_600_000_000);
    a.put("Trash/cur/y", b"y", 1_600_000_000);
    b.put("Junk/cur/z", b"z", 1_600_000_000);

    let peer = PeerConfig {
        scope: vec!["INBOX/cur".to_owned()],
        ..b.peer(Direction::Both)
    };
    let report = a.try_sync(&b, &peer).unwrap();
    assert_eq!(1, report.pushed);
    assert_eq!(
        vec!["INBOX/cur/x", "Junk/cur/z"],
        b.contents().keys().map(|k| k as &str).collect::<Vec<_>>()
    );
    assert!(!a.dirs().contains("Junk"));
}

#[test]
fn watermark_advances_only_after_clean_passes() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"x", 1_600_000_000);

    // Unreachable peer: nothing happens, no watermark
    let mut dead = unreachable_peer("dead");
    assert_matches!(Err(Error::Io(..)), dead.pass(&a.store, SKEW_MS));
    assert_eq!(None, a.store.watermark("dead"));

    // The peer refuses one file: the rest goes through but the watermark
    // stays put so the next pass looks again
    std::fs::create_dir_all(b.root().join("INBOX/cur/x/cur")).unwrap();
    a.put("INBOX/cur/w", b"w", 1_600_000_000);
    let report = a.sync(&b, Direction::Push);
    assert_eq!(1, report.skipped);
    assert_eq!(1, report.pushed);
    assert_eq!(None, a.store.watermark("b"));

    std::fs::remove_dir_all(b.root().join("INBOX/cur/x")).unwrap();
    let report = a.sync(&b, Direction::Push);
    assert_eq!(0, report.skipped);
    assert_eq!(1, report.pushed);
    assert!(a.store.watermark("b").is_some());
    assert_eq!(Some(b"x".to_vec()), b.read("INBOX/cur/x"));
}

#[test]
fn unchanged_directories_are_not_listed() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/cur/x", b"x", 1_600_000_000);
    a.sync(&b, Direction::Both);

    // Sneak a file into B without either side's directory looking modified
    b.put("INBOX/cur/y", b"y", 1_600_000_000);
    for node in &[&a, &b] {
        file_ops::set_mtime(node.root().join("INBOX/cur"), 1_500_000_000_000)
            .unwrap();
    }
    let report = a.sync(&b, Direction::Both);
    assert!(report.is_noop(), "{}", report);
    assert_eq!(None, a.read("INBOX/cur/y"));

    // A peer without a watermark examines everything
    let fresh = PeerConfig {
        name: "b-again".to_owned(),
        ..b.peer(Direction::Both)
    };
    let report = a.try_sync(&b, &fresh).unwrap();
    assert_eq!(1, report.pulled);
    assert_eq!(Some(b"y".to_vec()), a.read("INBOX/cur/y"));
}
