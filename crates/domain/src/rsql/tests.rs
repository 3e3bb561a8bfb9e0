use proptest::prelude::*;

use super::*;

fn sensor() -> TargetFieldData {
    TargetFieldData::new()
        .with("id", "dev-1")
        .with("name", "Kitchen Sensor")
        .with("updatestatus", "in_sync")
        .with("attribute.device_type", "sensor")
        .with("attribute.firmware", "12")
        .with("tag", "beta")
        .with("tag", "eu")
}

fn parsed(query: &str) -> FilterExpression {
    FilterExpression::parse(query).unwrap_or_else(|_| unreachable!())
}

#[test]
fn parses_keywords_and_symbols_alike() {
    let keywords = parsed("name==a and tag==b or id==c");
    let symbols = parsed("name==a;tag==b,id==c");

    assert_eq!(keywords, symbols);
    assert!(matches!(keywords, FilterExpression::Or(ref children) if children.len() == 2));
}

#[test]
fn and_binds_tighter_than_or() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("id==nope;tag==beta,name==kitchen*", &data));
    assert!(!matcher.matches_query("id==nope;(tag==beta,name==kitchen*)", &data));
}

#[test]
fn rejects_unknown_fields_and_bad_sub_keys() {
    assert!(FilterExpression::parse("color==red").is_err());
    assert!(FilterExpression::parse("attribute==x").is_err());
    assert!(FilterExpression::parse("attribute.==x").is_err());
    assert!(FilterExpression::parse("name.first==x").is_err());
    assert!(FilterExpression::parse("NAME==x").is_ok());
}

#[test]
fn rejects_malformed_syntax() {
    for query in [
        "",
        "   ",
        "name",
        "name==",
        "name==a and",
        "(name==a",
        "name==a)",
        "name=='open",
        "name==(a,b)",
        "name=~a",
    ] {
        assert!(FilterExpression::parse(query).is_err(), "{query} should fail");
    }
}

#[test]
fn quoted_values_keep_spaces_and_reserved_characters() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("name=='Kitchen Sensor'", &data));
    assert!(matcher.matches_query("name==\"kitchen sensor\"", &data));
    assert_eq!(
        parsed("name=='a,b;(c)'"),
        FilterExpression::Comparison {
            path: FieldPath::parse("name").unwrap_or_else(|_| unreachable!()),
            operator: ComparisonOperator::Equal,
            arguments: vec!["a,b;(c)".to_owned()],
        }
    );
}

#[test]
fn wildcards_apply_to_equality_only() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("name==*sensor", &data));
    assert!(matcher.matches_query("name==k*n*r", &data));
    assert!(!matcher.matches_query("name!=*sensor", &data));
    assert!(!matcher.matches_query("name=in=(*sensor)", &data));
}

#[test]
fn unbound_fields_only_match_empty_pattern_and_out() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("description==''", &data));
    assert!(!matcher.matches_query("description==*", &data));
    assert!(!matcher.matches_query("description!=x", &data));
    assert!(!matcher.matches_query("attribute.missing=gt=1", &data));
    assert!(matcher.matches_query("attribute.missing=out=(x)", &data));
}

#[test]
fn multi_valued_fields_match_any_value() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("tag==eu", &data));
    assert!(matcher.matches_query("tag=in=(us,eu)", &data));
    assert!(!matcher.matches_query("tag=out=(us,eu)", &data));
    assert!(!matcher.matches_query("tag!=beta", &data));
}

#[test]
fn ordering_is_numeric_when_both_sides_are_numbers() {
    let matcher = FilterMatcher::default();
    let data = sensor();

    assert!(matcher.matches_query("attribute.firmware=gt=9", &data));
    assert!(matcher.matches_query("attribute.firmware>=12", &data));
    assert!(!matcher.matches_query("attribute.firmware<12", &data));
    assert!(matcher.matches_query("name=lt=z", &data));
}

#[test]
fn case_sensitivity_is_configurable() {
    let data = sensor();

    assert!(FilterMatcher::new(true).matches_query("name=='KITCHEN SENSOR'", &data));
    assert!(!FilterMatcher::new(false).matches_query("name=='KITCHEN SENSOR'", &data));
}

#[test]
fn sub_key_lookup_keeps_case_while_field_name_folds() {
    let matcher = FilterMatcher::default();
    let data = TargetFieldData::new().with("attribute.HwRev", "3");

    assert!(matcher.matches_query("ATTRIBUTE.HwRev==3", &data));
    assert!(!matcher.matches_query("attribute.hwrev==3", &data));
}

#[test]
fn sensor_tagged_beta_stops_matching_without_tag() {
    let matcher = FilterMatcher::default();
    let expression = parsed("attribute.device_type==sensor and tag==beta");

    assert!(matcher.matches(&expression, &sensor()));

    let untagged = TargetFieldData::new()
        .with("attribute.device_type", "sensor")
        .with("tag", "eu");
    assert!(!matcher.matches(&expression, &untagged));
}

#[test]
fn unparseable_query_never_matches() {
    assert!(!FilterMatcher::default().matches_query("name==(", &sensor()));
}

fn query_strategy() -> impl Strategy<Value = String> {
    let field = prop::sample::select(vec![
        "id",
        "name",
        "tag",
        "updatestatus",
        "attribute.device_type",
        "metadata.owner",
        "createdat",
    ]);
    let operator = prop::sample::select(vec![
        "==", "!=", "=gt=", ">=", "=lt=", "<=", "=in=", "=out=",
    ]);
    let comparison = (field, operator, "[a-z0-9*]{0,6}").prop_map(|(field, operator, value)| {
        format!("{field}{operator}'{value}'")
    });

    prop::collection::vec(comparison, 1..5).prop_flat_map(|comparisons| {
        let joins = prop::collection::vec(prop::sample::select(vec![";", ",", " and ", " or "]), comparisons.len());
        joins.prop_map(move |joins| {
            let mut query = String::new();
            for (index, comparison) in comparisons.iter().enumerate() {
                if index > 0 {
                    query.push_str(joins[index]);
                }
                query.push_str(comparison);
            }
            query
        })
    })
}

fn field_data_strategy() -> impl Strategy<Value = TargetFieldData> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["id", "name", "tag", "attribute.device_type", "createdat"]),
            "[a-zA-Z0-9]{0,6}",
        ),
        0..8,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .fold(TargetFieldData::new(), |data, (field, value)| data.with(field, value))
    })
}

proptest! {
    #[test]
    fn matching_is_total_and_deterministic(query in query_strategy(), data in field_data_strategy()) {
        let expression = FilterExpression::parse(query.as_str());
        prop_assert!(expression.is_ok());

        if let Ok(expression) = expression {
            let matcher = FilterMatcher::default();
            let first = matcher.matches(&expression, &data);
            prop_assert_eq!(first, matcher.matches(&expression, &data));
        }
    }

    #[test]
    fn id_equality_matches_its_own_value(value in "[a-zA-Z0-9._-]{1,20}") {
        let data = TargetFieldData::new().with("id", value.as_str());
        let query = format!("id=={value}");

        prop_assert!(FilterMatcher::default().matches_query(query.as_str(), &data));
        prop_assert!(FilterMatcher::new(false).matches_query(query.as_str(), &data));
    }
}
