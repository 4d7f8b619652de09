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

use super::defs::*;
use crate::support::chronox::now_seconds_ms;

#[test]
fn source_to_empty_destination() {
    let source = node("source");
    let dest = node("dest");

    source.put("INBOX/cur/1600000000.M1.host:2,S", b"first", 1_600_000_000);
    source.put("INBOX/cur/1600000001.M2.host:2,", b"second", 1_600_000_001);
    source.put("INBOX/new/1600000002.M3.host", b"third", 1_600_000_002);
    source.put("INBOX/tmp/1600000003.M4.host", b"partial", 1_600_000_003);
    source.put(".Sent Items/cur/1600000004.M5.host:2,S", b"sent", 1_600_000_004);
    source.put("stray-file-at-root", b"stray", 1_600_000_005);

    let report = source.sync(&dest, Direction::Push);
    assert_eq!(4, report.pushed);
    assert_eq!(0, report.pulled);
    assert_eq!(0, report.skipped);

    let mut expected = source.contents();
    expected.remove("INBOX/tmp/1600000003.M4.host");
    expected.remove("stray-file-at-root");
    assert_eq!(expected, dest.contents());
    assert_eq!(source.dirs(), dest.dirs());
    assert_eq!(
        1_600_000_004,
        dest.mtime(".Sent Items/cur/1600000004.M5.host:2,S")
    );

    let report = source.sync(&dest, Direction::Push);
    assert!(report.is_noop(), "{}", report);
    assert_eq!(0, report.skipped);

    // And from the other side, nothing to do either
    let report = dest.sync(&source, Direction::Both);
    assert!(report.is_noop(), "{}", report);
}

#[test]
fn rename_is_not_replayed_over_a_newer_version() {
    let a = node("a");
    let b = node("b");
    a.put("INBOX/new/1600000000.M1.a", b"original", 1_600_000_000);
    a.sync(&b, Direction::Both);

    // A files the message while B rewrites it under the old name, keeping
    // the length the same
    a.rename("INBOX/new/1600000000.M1.a", "INBOX/cur/1600000000.M1.a:2,S");
    b.put(
        "INBOX/new/1600000000.M1.a",
        b"modified",
        now_seconds_ms() / 1000 + 3600,
    );

    let report = a.sync(&b, Direction::Both);
    assert_eq!(0, report.moved);
    b.sync(&a, Direction::Both);
    a.sync(&b, Direction::Both);

    assert_eq!(a.contents(), b.contents());
    assert_eq!(
        Some(b"original".to_vec()),
        b.read("INBOX/cur/1600000000.M1.a:2,S")
    );
    assert_eq!(
        Some(b"modified".to_vec()),
        a.read("INBOX/new/1600000000.M1.a")
    );
}

#[test]
fn three_node_relay() {
    let a = node("a");
    let b = node("b");
    let c = node("c");

    a.put("INBOX/new/1600000000.M1.a", b"hello", 1_600_000_000);
    a.sync(&b, Direction::Both);
    c.sync(&b, Direction::Both);
    assert_eq!(a.contents(), c.contents());

    // Deleted on C, relayed back to A through B
    c.remove("INBOX/new/1600000000.M1.a");
    let report = c.sync(&b, Direction::Both);
    assert_eq!(1, report.deleted_remote);
    let report = a.sync(&b, Direction::Both);
    assert_eq!(1, report.deleted_local);
    assert!(a.contents().is_empty());
    assert!(b.contents().is_empty());

    // A rename on A travels as a move
    a.put("INBOX/new/1600000001.M2.a", b"second", 1_600_000_001);
    a.sync(&b, Direction::Both);
    c.sync(&b, Direction::Both);
    a.rename(
        "INBOX/new/1600000001.M2.a",
        "INBOX/cur/1600000001.M2.a:2,S",
    );
    let report = a.sync(&b, Direction::Both);
    assert_eq!(1, report.moved);
    assert_eq!(0, report.pushed);
    let report = c.sync(&b, Direction::Both);
    assert_eq!(1, report.pulled);
    assert_eq!(1, report.deleted_local);

    assert_eq!(a.contents(), b.contents());
    assert_eq!(a.contents(), c.contents());
    assert_eq!(
        vec!["INBOX/cur/1600000001.M2.a:2,S"],
        c.contents().keys().map(|k| k as &str).collect::<Vec<_>>()
    );
}

fn diverge(a: &Node, b: &Node, c: &Node) {
    a.put("INBOX/cur/1.a", b"from a", 1_600_000_000);
    a.put("INBOX/cur/shared", b"old", 1_600_000_000);
    b.put("INBOX/cur/1.b", b"from b", 1_600_000_000);
    b.put("INBOX/cur/shared", b"newer", 1_600_000_100);
    c.put(".Trash/cur/1.c", b"from c", 1_600_000_000);
}

#[test]
fn any_pairwise_order_converges() {
    let orders: &[[usize; 3]] = &[
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let nodes = [node("a"), node("b"), node("c")];
        diverge(&nodes[0], &nodes[1], &nodes[2]);
        let pairs = [(0, 1), (1, 2), (2, 0)];

        for _ in 0..2 {
            for &ix in order {
                let (from, to) = pairs[ix];
                nodes[from].sync(&nodes[to], Direction::Both);
            }
        }

        let expected = nodes[0].contents();
        assert_eq!(expected, nodes[1].contents(), "Order {:?}", order);
        assert_eq!(expected, nodes[2].contents(), "Order {:?}", order);
        assert_eq!(4, expected.len());
        assert_eq!(
            Some(&b"newer".to_vec()),
            expected.get("INBOX/cur/shared")
        );
    }
}

#[test]
fn concurrent_passes_converge() {
    let a = node("a");
    let b = node("b");
    let c = node("c");
    diverge(&a, &b, &c);

    // Passes running at the same time may trip over each other; whatever
    // they manage is fine as long as it does not prevent convergence.
    let ((ab, bc), ca) = rayon::join(
        || {
            rayon::join(
                || a.try_sync(&b, &b.peer(Direction::Both)),
                || b.try_sync(&c, &c.peer(Direction::Both)),
            )
        },
        || c.try_sync(&a, &a.peer(Direction::Both)),
    );
    for result in vec![ab, bc, ca] {
        if let Err(e) = result {
            log::warn!("Concurrent pass failed: {}", e);
        }
    }

    for _ in 0..2 {
        a.sync(&b, Direction::Both);
        b.sync(&c, Direction::Both);
        c.sync(&a, Direction::Both);
    }

    assert_eq!(a.contents(), b.contents());
    assert_eq!(a.contents(), c.contents());
    assert_eq!(4, a.contents().len());
}
