//! Lane planning for parallel test execution.
//!
//! Tests that declare the same group are always placed in the same lane and
//! run sequentially there. Ungrouped tests are spread across lanes.

use gridline_core::config::SuiteCase;
use std::collections::HashMap;

/// One sequential execution lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lane {
    pub index: usize,
    pub cases: Vec<SuiteCase>,
}

/// Distribute `cases` over at most `workers` lanes.
///
/// Units (a whole group, or a single ungrouped case) are assigned in order of
/// first appearance to the currently least-loaded lane. Empty lanes are not
/// returned.
pub fn plan_lanes(cases: &[SuiteCase], workers: usize) -> Vec<Lane> {
    let mut units: Vec<Vec<SuiteCase>> = Vec::new();
    let mut group_unit: HashMap<&str, usize> = HashMap::new();

    for case in cases {
        match case.group.as_deref() {
            Some(group) => match group_unit.get(group) {
                Some(&unit) => units[unit].push(case.clone()),
                None => {
                    group_unit.insert(group, units.len());
                    units.push(vec![case.clone()]);
                }
            },
            None => units.push(vec![case.clone()]),
        }
    }

    let lane_count = workers.max(1).min(units.len());
    let mut lanes: Vec<Lane> = (0..lane_count)
        .map(|index| Lane {
            index,
            cases: Vec::new(),
        })
        .collect();

    for unit in units {
        if let Some(lane) = lanes.iter_mut().min_by_key(|l| (l.cases.len(), l.index)) {
            lane.cases.extend(unit);
        }
    }

    lanes.retain(|l| !l.cases.is_empty());
    lanes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: &str, group: Option<&str>) -> SuiteCase {
        SuiteCase {
            id: id.to_string(),
            command: "true".to_string(),
            markers: vec!["core".to_string()],
            group: group.map(String::from),
            timeout_secs: None,
        }
    }

    fn lane_of(lanes: &[Lane], id: &str) -> usize {
        lanes
            .iter()
            .find(|l| l.cases.iter().any(|c| c.id == id))
            .map(|l| l.index)
            .unwrap()
    }

    #[test]
    fn test_grouped_cases_share_a_lane() {
        let cases = vec![
            case("a", Some("pg_conn")),
            case("b", None),
            case("c", Some("pg_conn")),
            case("d", None),
            case("e", Some("pg_conn")),
        ];
        let lanes = plan_lanes(&cases, 4);

        let lane = lane_of(&lanes, "a");
        assert_eq!(lane_of(&lanes, "c"), lane);
        assert_eq!(lane_of(&lanes, "e"), lane);
        let total: usize = lanes.iter().map(|l| l.cases.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_group_order_preserved_within_lane() {
        let cases = vec![case("a", Some("g")), case("b", Some("g")), case("c", Some("g"))];
        let lanes = plan_lanes(&cases, 8);
        assert_eq!(lanes.len(), 1);
        let ids: Vec<&str> = lanes[0].cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ungrouped_cases_balance() {
        let cases: Vec<SuiteCase> = (0..6).map(|i| case(&format!("t{}", i), None)).collect();
        let lanes = plan_lanes(&cases, 3);
        assert_eq!(lanes.len(), 3);
        assert!(lanes.iter().all(|l| l.cases.len() == 2));
    }

    #[test]
    fn test_single_worker_runs_everything_in_one_lane() {
        let cases = vec![case("a", Some("g")), case("b", None)];
        let lanes = plan_lanes(&cases, 1);
        assert_eq!(lanes.len(), 1);
        assert_eq!(lanes[0].cases.len(), 2);
    }

    #[test]
    fn test_no_cases_no_lanes() {
        assert!(plan_lanes(&[], 4).is_empty());
    }
}
