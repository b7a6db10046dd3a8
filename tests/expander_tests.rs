//! Target expansion against realistic namespace catalogs.

use pogo::namespace::Namespace;
use pogo::target::{expand, TargetError};

fn fleet() -> Namespace {
    Namespace::from_yaml(
        "fleet",
        r#"
hosts:
  db01.example.com: [db]
  db02.example.com: [db, primary]
  web01.example.com: [web]
  web02.example.com: [web]
  web03.example.com: [web, canary]
"#,
    )
    .unwrap()
}

#[test]
fn ten_host_range_expands_in_order() {
    let hosts = expand("foo[1-10].example.com", &fleet()).unwrap();
    assert_eq!(hosts.len(), 10);
    assert_eq!(hosts[0], "foo1.example.com");
    assert_eq!(hosts[9], "foo10.example.com");
}

#[test]
fn tag_minus_tag_difference() {
    let hosts = expand("%web - %canary", &fleet()).unwrap();
    assert_eq!(
        hosts,
        vec!["web01.example.com".to_string(), "web02.example.com".to_string()]
    );
}

#[test]
fn union_of_tag_and_range_dedups_against_overlap() {
    let hosts = expand("%db,db[01-02].example.com", &fleet()).unwrap();
    assert_eq!(
        hosts,
        vec!["db01.example.com".to_string(), "db02.example.com".to_string()]
    );
}

#[test]
fn difference_against_pattern() {
    let hosts = expand("%web - web[02-03].example.com", &fleet()).unwrap();
    assert_eq!(hosts, vec!["web01.example.com".to_string()]);
}

#[test]
fn unknown_tag_names_the_offender() {
    assert_eq!(
        expand("%web,%nope", &fleet()),
        Err(TargetError::UnknownTag("nope".to_string()))
    );
}

#[test]
fn expansion_order_is_independent_of_call_count() {
    let ns = fleet();
    let first = expand("%web,%db - %primary", &ns).unwrap();
    for _ in 0..10 {
        assert_eq!(expand("%web,%db - %primary", &ns).unwrap(), first);
    }
}
