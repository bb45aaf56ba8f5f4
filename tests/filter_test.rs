/// Filter evaluation against a plain attribute map
///
/// Covers every filter kind, the three-valued combinators and the built-in
/// matching rules used by equality, ordering and substring assertions.
use ldap_server_rs::filter::{evaluate, Assertion, Filter, SubstringsAssertion, Truth};
use ldap_server_rs::result::ResultCode;
use std::collections::HashMap;

fn input() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("foo".to_string(), vec!["abc".to_string(), "def".to_string()]),
        ("bar".to_string(), vec!["wibblespong".to_string()]),
    ])
}

fn run(filter: &Filter) -> Truth {
    evaluate(filter, &input()).expect("filter should evaluate")
}

fn eq(attr: &str, rule: Option<&str>, value: &str) -> Filter {
    let assertion = Assertion::new(attr, value);
    Filter::Equality(match rule {
        Some(rule) => assertion.with_rule(rule),
        None => assertion,
    })
}

fn ge(attr: &str, value: &str) -> Filter {
    Filter::GreaterOrEqual(Assertion::new(attr, value))
}

fn le(attr: &str, value: &str) -> Filter {
    Filter::LessOrEqual(Assertion::new(attr, value))
}

fn substrings(
    attr: &str,
    rule: Option<&str>,
    initial: Option<&str>,
    any: &[&str],
    final_: Option<&str>,
) -> Filter {
    let mut assertion = SubstringsAssertion::new(attr);
    if let Some(rule) = rule {
        assertion = assertion.with_rule(rule);
    }
    if let Some(initial) = initial {
        assertion = assertion.initial(initial);
    }
    for segment in any {
        assertion = assertion.any(*segment);
    }
    if let Some(final_) = final_ {
        assertion = assertion.final_(final_);
    }
    Filter::Substrings(assertion)
}

fn all_true(filters: &[Filter]) -> bool {
    filters.iter().all(|f| run(f) == Truth::True)
}

fn none_true(filters: &[Filter]) -> bool {
    filters.iter().all(|f| run(f) != Truth::True)
}

// Present filters

#[test]
fn test_present_existing_attribute() {
    assert_eq!(run(&Filter::present("foo")), Truth::True);
}

#[test]
fn test_present_missing_attribute() {
    assert_eq!(run(&Filter::present("foofoo")), Truth::False);
}

// Wrong filters

#[test]
fn test_unknown_filter_is_operations_error() {
    let empty: HashMap<String, Vec<String>> = HashMap::new();
    let err = evaluate(&Filter::Unknown("whatever".to_string()), &empty).unwrap_err();
    assert_eq!(err.code(), ResultCode::OperationsError);
}

#[test]
fn test_unknown_matching_rule_is_operations_error() {
    let err = evaluate(&eq("foo", Some("noSuchMatch"), "abc"), &input()).unwrap_err();
    assert_eq!(err.code(), ResultCode::OperationsError);
}

// Edge-case filters

#[test]
fn test_constant_filters() {
    let empty: HashMap<String, Vec<String>> = HashMap::new();
    assert_eq!(evaluate(&Filter::True, &empty).unwrap(), Truth::True);
    assert_eq!(evaluate(&Filter::False, &empty).unwrap(), Truth::False);
    assert_eq!(evaluate(&Filter::Undefined, &empty).unwrap(), Truth::Undefined);
}

// Equality filters without matching rule

#[test]
fn test_equality_matches_existing_pair() {
    assert_eq!(run(&eq("foo", None, "abc")), Truth::True);
    assert!(all_true(&[eq("foo", None, "abc"), eq("foo", None, "def")]));
}

#[test]
fn test_equality_no_value_match() {
    assert_eq!(run(&eq("foo", None, "not_matched")), Truth::False);
    assert_eq!(run(&eq("foo", None, "ABC")), Truth::False);
}

#[test]
fn test_equality_missing_attribute() {
    assert_eq!(run(&eq("not_attr", None, "abc")), Truth::False);
}

#[test]
fn test_attribute_keys_are_case_sensitive() {
    assert_eq!(run(&eq("FOO", None, "abc")), Truth::False);
}

// Equality filters with caseIgnoreMatch

#[test]
fn test_case_ignore_equality() {
    let rule = Some("caseIgnoreMatch");
    assert_eq!(run(&eq("foo", rule, "abc")), Truth::True);
    assert_eq!(run(&eq("foo", rule, "ABC")), Truth::True);
    assert!(all_true(&[eq("foo", rule, "abC"), eq("foo", rule, "dEf")]));
    assert_eq!(run(&eq("foo", rule, "not_matched")), Truth::False);
    assert_eq!(run(&eq("not_attr", rule, "abc")), Truth::False);
}

// Ordering filters

#[test]
fn test_greater_or_equal() {
    assert_eq!(run(&ge("foo", "abc")), Truth::True);
    assert_eq!(run(&ge("foo", "a")), Truth::True);
    assert_eq!(run(&ge("bar", "wibblespong2")), Truth::False);
    assert_eq!(run(&ge("not_attr", "abc")), Truth::False);
}

#[test]
fn test_less_or_equal() {
    assert_eq!(run(&le("foo", "abc")), Truth::True);
    assert_eq!(run(&le("foo", "a")), Truth::False);
    assert_eq!(run(&le("bar", "wibblespong2")), Truth::True);
    assert_eq!(run(&le("not_attr", "abc")), Truth::False);
}

// Substring filters with initial substrings only

#[test]
fn test_substrings_initial_only() {
    assert!(all_true(&[
        substrings("foo", None, Some("a"), &[], None),
        substrings("foo", None, Some("ab"), &[], None),
        substrings("foo", None, Some("abc"), &[], None),
        substrings("foo", None, Some("def"), &[], None),
        substrings("foo", None, Some(""), &[], None),
    ]));
    assert!(none_true(&[
        substrings("foo", None, Some("b"), &[], None),
        substrings("foo", None, Some("bc"), &[], None),
        substrings("foo", None, Some("ac"), &[], None),
        substrings("foo", None, Some("bd"), &[], None),
        substrings("not_attr", None, Some(""), &[], None),
        substrings("not_attr", None, Some("abc"), &[], None),
    ]));
}

#[test]
fn test_substrings_initial_and_any() {
    assert!(all_true(&[
        substrings("foo", None, Some(""), &["a"], None),
        substrings("foo", None, Some("a"), &["b"], None),
        substrings("foo", None, Some("ab"), &["c"], None),
        substrings("foo", None, Some("abc"), &[""], None),
        substrings("foo", None, Some("d"), &[""], None),
        substrings("foo", None, Some(""), &[""], None),
    ]));
    assert!(none_true(&[
        substrings("foo", None, Some("b"), &[""], None),
        substrings("foo", None, Some("b"), &["c"], None),
        substrings("not_attr", None, Some(""), &[""], None),
        substrings("not_attr", None, Some("a"), &["b"], None),
    ]));
}

#[test]
fn test_substrings_final_only() {
    assert!(all_true(&[
        substrings("foo", None, None, &[], Some("c")),
        substrings("foo", None, None, &[], Some("bc")),
        substrings("foo", None, None, &[], Some("abc")),
        substrings("foo", None, None, &[], Some("")),
    ]));
    assert!(none_true(&[
        substrings("foo", None, None, &[], Some("d")),
        substrings("not_attr", None, None, &[], Some("")),
        substrings("not_attr", None, None, &[], Some("0abc")),
    ]));
}

#[test]
fn test_substrings_any_and_final() {
    assert!(all_true(&[
        substrings("foo", None, None, &[""], Some("c")),
        substrings("foo", None, None, &["b"], Some("c")),
        substrings("foo", None, None, &["ab"], Some("c")),
        substrings("foo", None, None, &[""], Some("")),
    ]));
    assert!(none_true(&[
        substrings("foo", None, None, &["b"], Some("d")),
        substrings("foo", None, None, &["ab"], Some("d")),
        substrings("foo", None, None, &["abc"], Some("d")),
        substrings("not_attr", None, None, &["b"], Some("c")),
    ]));
}

#[test]
fn test_substrings_initial_any_and_final() {
    assert!(all_true(&[
        substrings("foo", None, Some("a"), &[""], Some("c")),
        substrings("foo", None, Some("a"), &["b"], Some("c")),
        substrings("foo", None, Some(""), &["ab"], Some("c")),
        substrings("foo", None, Some("a"), &["b"], Some("")),
        substrings("foo", None, Some(""), &[""], Some("")),
    ]));
    assert!(none_true(&[
        substrings("foo", None, Some("x"), &["b"], Some("c")),
        substrings("foo", None, Some("a"), &["x"], Some("c")),
        substrings("foo", None, Some("a"), &["b"], Some("x")),
        substrings("not_attr", None, Some("a"), &["b"], Some("c")),
    ]));
}

#[test]
fn test_substrings_segments_do_not_overlap() {
    // "abc" has no room for "bc" after "ab"
    assert_eq!(
        run(&substrings("foo", None, Some("ab"), &[], Some("bc"))),
        Truth::False
    );
    assert_eq!(
        run(&substrings("bar", None, None, &["bble", "sp"], Some("ong"))),
        Truth::True
    );
    assert_eq!(
        run(&substrings("bar", None, None, &["sp", "bble"], None)),
        Truth::False
    );
}

// Substring filters for case insensitive IA5 strings

#[test]
fn test_substrings_case_ignore_ia5() {
    let rule = Some("caseIgnoreIA5SubstringsMatch");
    assert!(all_true(&[
        substrings("foo", rule, Some("a"), &[], None),
        substrings("foo", rule, Some("A"), &[], None),
        substrings("foo", rule, Some("aB"), &[], None),
        substrings("foo", rule, Some("A"), &["b"], None),
        substrings("foo", rule, Some("A"), &["B"], Some("C")),
        substrings("foo", rule, Some("a"), &["b"], Some("C")),
        substrings("foo", rule, Some("dEf"), &[], None),
        substrings("foo", rule, Some(""), &[""], Some("")),
    ]));
    assert!(none_true(&[
        substrings("foo", rule, Some("b"), &[], None),
        substrings("foo", rule, Some("bc"), &[], None),
        substrings("foo", rule, Some("ac"), &[], None),
        substrings("not_attr", rule, Some("abc"), &[], None),
    ]));
}

// Conjunction and disjunction

#[test]
fn test_and_truth_table() {
    let and = |a: Filter, b: Filter| run(&Filter::And(vec![a, b]));
    assert_eq!(and(Filter::True, Filter::True), Truth::True);
    assert_eq!(and(Filter::True, Filter::False), Truth::False);
    assert_eq!(and(Filter::False, Filter::False), Truth::False);
    assert_eq!(and(Filter::False, Filter::True), Truth::False);
    assert_eq!(and(Filter::True, Filter::Undefined), Truth::Undefined);
    assert_eq!(and(Filter::Undefined, Filter::False), Truth::False);
    assert_eq!(run(&Filter::And(vec![])), Truth::True);
}

#[test]
fn test_or_truth_table() {
    let or = |a: Filter, b: Filter| run(&Filter::Or(vec![a, b]));
    assert_eq!(or(Filter::True, Filter::True), Truth::True);
    assert_eq!(or(Filter::True, Filter::False), Truth::True);
    assert_eq!(or(Filter::False, Filter::False), Truth::False);
    assert_eq!(or(Filter::False, Filter::True), Truth::True);
    assert_eq!(or(Filter::False, Filter::Undefined), Truth::Undefined);
    assert_eq!(or(Filter::Undefined, Filter::True), Truth::True);
    assert_eq!(run(&Filter::Or(vec![])), Truth::False);
}

#[test]
fn test_short_circuit_skips_invalid_children() {
    let invalid = Filter::Unknown("whatever".to_string());
    assert_eq!(
        run(&Filter::And(vec![Filter::False, invalid.clone()])),
        Truth::False
    );
    assert_eq!(run(&Filter::Or(vec![Filter::True, invalid])), Truth::True);
}

// Negation filters

#[test]
fn test_negation() {
    assert!(none_true(&[
        Filter::not(eq("foo", None, "abc")),
        Filter::not(Filter::present("foo")),
        Filter::not(Filter::True),
        Filter::not(Filter::Undefined),
        Filter::not(ge("foo", "abc")),
        Filter::not(le("foo", "abc")),
        Filter::not(substrings("foo", None, Some("a"), &["b"], Some("c"))),
        Filter::not(Filter::And(vec![Filter::True, Filter::True])),
        Filter::not(Filter::Or(vec![Filter::True, Filter::True])),
    ]));
    assert_eq!(run(&Filter::not(Filter::False)), Truth::True);
    assert_eq!(run(&Filter::not(Filter::Undefined)), Truth::Undefined);
    assert_eq!(run(&Filter::not(eq("not_attr", None, "x"))), Truth::True);
}

#[test]
fn test_evaluation_does_not_change_input() {
    let attrs = input();
    let before = attrs.clone();
    let filter = Filter::And(vec![
        Filter::present("foo"),
        substrings("bar", Some("caseIgnoreSubstringsMatch"), Some("WIB"), &[], None),
    ]);
    assert_eq!(evaluate(&filter, &attrs).unwrap(), Truth::True);
    assert_eq!(evaluate(&filter, &attrs).unwrap(), Truth::True);
    assert_eq!(attrs, before);
}
