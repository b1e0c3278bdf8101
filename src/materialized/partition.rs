// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

/*!

Partition ranges, and the diff between the partitions of a base table and
the partitions of a materialized view derived from it.

A materialized view is partitioned either by the same column as its base table
(the identity case) or by a time bucket of it, e.g. `date_trunc('month', dt)`
over a table partitioned by day (the rollup case). In both cases the partitions the
view *should* have are a function of the base table's partitions; [`compute_partition_diff`]
compares those against the partitions the view *does* have.

Base and view partitions are related many-to-many: in the rollup case every view partition
covers several base partitions, and a base partition may straddle two buckets.
[`compute_partition_mapping`] builds both directions of that relation and
[`expand_potential_refresh`] closes a set of changed partitions over it.

*/

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt::{self, Display},
    str::FromStr,
};

use chrono::{DateTime, Datelike, Days, Months, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use datafusion_common::{not_impl_err, plan_err, DataFusionError, Result, ScalarValue};
use datafusion_expr::interval_arithmetic::Interval;

/// A half-open range `[lower, upper)` of partition column values.
/// A null bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionRange {
    lower: ScalarValue,
    upper: ScalarValue,
}

impl PartitionRange {
    /// The range `[lower, upper)`. Errors if it is empty.
    pub fn try_new(lower: ScalarValue, upper: ScalarValue) -> Result<Self> {
        if !lower.is_null() && !upper.is_null() {
            match lower.partial_cmp(&upper) {
                Some(Ordering::Less) => {}
                Some(_) => return plan_err!("empty partition range [{lower}, {upper})"),
                None => return plan_err!("incomparable partition bounds {lower:?} and {upper:?}"),
            }
        }

        Ok(Self { lower, upper })
    }

    /// The range of all values.
    pub fn unbounded() -> Self {
        Self {
            lower: ScalarValue::Null,
            upper: ScalarValue::Null,
        }
    }

    /// Inclusive lower bound
    pub fn lower(&self) -> &ScalarValue {
        &self.lower
    }

    /// Exclusive upper bound
    pub fn upper(&self) -> &ScalarValue {
        &self.upper
    }

    /// Whether both bounds are finite.
    pub fn is_bounded(&self) -> bool {
        !self.lower.is_null() && !self.upper.is_null()
    }

    /// Whether the two ranges share a value.
    pub fn intersects(&self, other: &Self) -> bool {
        strictly_below(&self.lower, &other.upper) && strictly_below(&other.lower, &self.upper)
    }

    /// Whether this range shares a value with the closed interval `interval`.
    /// Bounds of different types are assumed to intersect.
    pub fn intersects_interval(&self, interval: &Interval) -> bool {
        let starts_before_end = self.lower.is_null()
            || interval.upper().is_null()
            || self.lower.partial_cmp(interval.upper()) != Some(Ordering::Greater);
        starts_before_end && strictly_below(interval.lower(), &self.upper)
    }
}

/// `lower < upper`, where null bounds are infinite and incomparable bounds are assumed ordered.
fn strictly_below(lower: &ScalarValue, upper: &ScalarValue) -> bool {
    lower.is_null()
        || upper.is_null()
        || !matches!(
            lower.partial_cmp(upper),
            Some(Ordering::Greater | Ordering::Equal)
        )
}

impl Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |v: &ScalarValue, inf: &'static str| {
            if v.is_null() {
                inf.to_string()
            } else {
                v.to_string()
            }
        };
        write!(
            f,
            "[{}, {})",
            bound(&self.lower, "-inf"),
            bound(&self.upper, "+inf")
        )
    }
}

/// Time buckets a materialized view may be partitioned by.
/// Buckets are computed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeGranularity {
    /// Hours
    Hour,
    /// Days
    Day,
    /// Weeks starting on Monday
    Week,
    /// Calendar months
    Month,
    /// Calendar quarters
    Quarter,
    /// Calendar years
    Year,
}

impl FromStr for TimeGranularity {
    type Err = DataFusionError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "hour" => Self::Hour,
            "day" => Self::Day,
            "week" => Self::Week,
            "month" => Self::Month,
            "quarter" => Self::Quarter,
            "year" => Self::Year,
            _ => return not_impl_err!("unsupported time granularity '{s}'"),
        })
    }
}

impl Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
            Self::Year => "year",
        })
    }
}

impl TimeGranularity {
    /// Start of the bucket containing `t`.
    pub fn truncate(&self, t: NaiveDateTime) -> Result<NaiveDateTime> {
        let date = t.date();
        let start_of_day = date.and_time(NaiveTime::MIN);
        let first_of_month = |month: u32| {
            date.with_day(1)
                .and_then(|d| d.with_month(month))
                .map(|d| d.and_time(NaiveTime::MIN))
        };

        match self {
            Self::Hour => Some(start_of_day + TimeDelta::hours(t.hour().into())),
            Self::Day => Some(start_of_day),
            Self::Week => start_of_day
                .checked_sub_days(Days::new(date.weekday().num_days_from_monday().into())),
            Self::Month => first_of_month(date.month()),
            Self::Quarter => first_of_month(date.month0() / 3 * 3 + 1),
            Self::Year => first_of_month(1),
        }
        .ok_or_else(|| DataFusionError::Plan(format!("cannot truncate {t} to {self}")))
    }

    /// Start of the bucket after the one starting at `start`.
    pub fn next(&self, start: NaiveDateTime) -> Result<NaiveDateTime> {
        match self {
            Self::Hour => start.checked_add_signed(TimeDelta::hours(1)),
            Self::Day => start.checked_add_days(Days::new(1)),
            Self::Week => start.checked_add_days(Days::new(7)),
            Self::Month => start.checked_add_months(Months::new(1)),
            Self::Quarter => start.checked_add_months(Months::new(3)),
            Self::Year => start.checked_add_months(Months::new(12)),
        }
        .ok_or_else(|| DataFusionError::Plan(format!("no {self} after {start}")))
    }

    /// Name of the view partition for the bucket starting at `start`,
    /// e.g. `p2024`, `p2024q1`, `p202401`, `p20240115` or `p2024011503`.
    pub fn partition_name(&self, start: NaiveDateTime) -> String {
        match self {
            Self::Year => start.format("p%Y").to_string(),
            Self::Quarter => format!("p{}q{}", start.year(), start.month0() / 3 + 1),
            Self::Month => start.format("p%Y%m").to_string(),
            Self::Week | Self::Day => start.format("p%Y%m%d").to_string(),
            Self::Hour => start.format("p%Y%m%d%H").to_string(),
        }
    }

    /// Every bucket touched by `range`, named and converted back to the type of its bounds.
    pub fn buckets(&self, range: &PartitionRange) -> Result<Vec<(String, PartitionRange)>> {
        if !range.is_bounded() {
            return not_impl_err!("cannot roll up unbounded partition {range}");
        }
        if *self == Self::Hour && matches!(range.lower(), ScalarValue::Date32(_) | ScalarValue::Date64(_))
        {
            return not_impl_err!("hourly buckets of dates");
        }

        let upper = to_datetime(range.upper())?;
        let mut start = self.truncate(to_datetime(range.lower())?)?;
        let mut buckets = vec![];
        while start < upper {
            let end = self.next(start)?;
            buckets.push((
                self.partition_name(start),
                PartitionRange::try_new(
                    from_datetime(start, range.lower())?,
                    from_datetime(end, range.lower())?,
                )?,
            ));
            start = end;
        }

        Ok(buckets)
    }
}

/// Interpret a date or timestamp value as a UTC datetime.
pub(crate) fn to_datetime(value: &ScalarValue) -> Result<NaiveDateTime> {
    let datetime = match value {
        ScalarValue::Date32(Some(days)) => DateTime::from_timestamp(i64::from(*days) * 86_400, 0),
        ScalarValue::Date64(Some(ms))
        | ScalarValue::TimestampMillisecond(Some(ms), _) => DateTime::from_timestamp_millis(*ms),
        ScalarValue::TimestampSecond(Some(s), _) => DateTime::from_timestamp(*s, 0),
        ScalarValue::TimestampMicrosecond(Some(us), _) => DateTime::from_timestamp_micros(*us),
        ScalarValue::TimestampNanosecond(Some(ns), _) => Some(DateTime::from_timestamp_nanos(*ns)),
        _ => return not_impl_err!("time buckets of {value:?}"),
    };

    datetime
        .map(|t| t.naive_utc())
        .ok_or_else(|| DataFusionError::Plan(format!("{value} is out of range")))
}

/// Convert a UTC datetime to a value of the same type as `like`.
pub(crate) fn from_datetime(t: NaiveDateTime, like: &ScalarValue) -> Result<ScalarValue> {
    let t = t.and_utc();
    Ok(match like {
        ScalarValue::Date32(_) => {
            let days = t.timestamp().div_euclid(86_400);
            match i32::try_from(days) {
                Ok(days) => ScalarValue::Date32(Some(days)),
                Err(_) => return plan_err!("{t} is out of range for Date32"),
            }
        }
        ScalarValue::Date64(_) => ScalarValue::Date64(Some(t.timestamp_millis())),
        ScalarValue::TimestampSecond(_, tz) => ScalarValue::TimestampSecond(Some(t.timestamp()), tz.clone()),
        ScalarValue::TimestampMillisecond(_, tz) => {
            ScalarValue::TimestampMillisecond(Some(t.timestamp_millis()), tz.clone())
        }
        ScalarValue::TimestampMicrosecond(_, tz) => {
            ScalarValue::TimestampMicrosecond(Some(t.timestamp_micros()), tz.clone())
        }
        ScalarValue::TimestampNanosecond(_, tz) => match t.timestamp_nanos_opt() {
            Some(ns) => ScalarValue::TimestampNanosecond(Some(ns), tz.clone()),
            None => return plan_err!("{t} is out of range for nanosecond timestamps"),
        },
        _ => return not_impl_err!("time buckets of {like:?}"),
    })
}

/// Partitions to add to and drop from a materialized view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionDiff {
    /// Partitions the view should have but doesn't
    pub adds: BTreeMap<String, PartitionRange>,
    /// Partitions the view has but shouldn't
    pub deletes: BTreeMap<String, PartitionRange>,
}

impl PartitionDiff {
    /// Whether the view's partitions are already as expected.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty()
    }

    /// `partitions`, with this diff applied.
    pub fn apply(&self, partitions: &BTreeMap<String, PartitionRange>) -> BTreeMap<String, PartitionRange> {
        let mut applied = partitions.clone();
        for name in self.deletes.keys() {
            applied.remove(name);
        }
        applied.extend(self.adds.clone());
        applied
    }
}

/// Compare the partitions a view should have, given its base table's `base` partitions,
/// against the view's existing `mv` partitions.
///
/// With no `granularity` the view is partitioned like its base table and the diff is a set difference
/// on ranges. Otherwise every base partition is expanded into the buckets it touches;
/// an existing view partition that isn't exactly one of those buckets is dropped and rebuilt.
pub fn compute_partition_diff(
    base: &BTreeMap<String, PartitionRange>,
    mv: &BTreeMap<String, PartitionRange>,
    granularity: Option<TimeGranularity>,
) -> Result<PartitionDiff> {
    let expected = match granularity {
        None => base.clone(),
        Some(granularity) => {
            let mut buckets = BTreeMap::new();
            for range in base.values() {
                buckets.extend(granularity.buckets(range)?);
            }
            buckets
        }
    };

    let existing = mv.values().collect::<HashSet<_>>();
    let wanted = expected.values().collect::<HashSet<_>>();

    let adds = expected
        .iter()
        .filter(|(_, range)| !existing.contains(range))
        .map(|(name, range)| (name.clone(), range.clone()))
        .collect();
    let deletes = mv
        .iter()
        .filter(|(_, range)| !wanted.contains(range))
        .map(|(name, range)| (name.clone(), range.clone()))
        .collect();

    Ok(PartitionDiff { adds, deletes })
}

/// Map each `src` partition to the `dst` partitions whose ranges intersect it.
/// Partitions with no counterpart map to an empty set.
pub fn generate_partition_ref_map(
    src: &BTreeMap<String, PartitionRange>,
    dst: &BTreeMap<String, PartitionRange>,
) -> BTreeMap<String, BTreeSet<String>> {
    src.iter()
        .map(|(name, range)| {
            let refs = dst
                .iter()
                .filter(|(_, other)| range.intersects(other))
                .map(|(other, _)| other.clone())
                .collect();
            (name.clone(), refs)
        })
        .collect()
}

/// The diff between base and view partitions, and how they reference each other once it is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMapping {
    /// Partitions to add to and drop from the view
    pub diff: PartitionDiff,
    /// base partition -> view partitions it feeds
    pub base_to_mv: BTreeMap<String, BTreeSet<String>>,
    /// view partition -> base partitions it reads
    pub mv_to_base: BTreeMap<String, BTreeSet<String>>,
}

/// Diff `base` against `mv`, then relate the base partitions to the view's partitions after the diff.
pub fn compute_partition_mapping(
    base: &BTreeMap<String, PartitionRange>,
    mv: &BTreeMap<String, PartitionRange>,
    granularity: Option<TimeGranularity>,
) -> Result<PartitionMapping> {
    let diff = compute_partition_diff(base, mv, granularity)?;
    let mv = diff.apply(mv);

    Ok(PartitionMapping {
        base_to_mv: generate_partition_ref_map(base, &mv),
        mv_to_base: generate_partition_ref_map(&mv, base),
        diff,
    })
}

/// Partitions affected by a change, on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSet {
    /// View partitions to recompute
    pub mv_partitions: BTreeSet<String>,
    /// Base partitions those view partitions read
    pub base_partitions: BTreeSet<String>,
}

/// Every view partition affected by a change to `changed` base partitions.
///
/// A view partition is recomputed from all the base partitions it reads, and those may
/// feed other view partitions in turn, so the sets are closed over both directions of the mapping.
pub fn expand_potential_refresh<'a>(
    mapping: &PartitionMapping,
    changed: impl IntoIterator<Item = &'a String>,
) -> RefreshSet {
    let mut result = RefreshSet::default();
    let mut pending_base = changed.into_iter().cloned().collect::<Vec<_>>();

    while let Some(base) = pending_base.pop() {
        if !result.base_partitions.insert(base.clone()) {
            continue;
        }
        for mv in mapping.base_to_mv.get(&base).into_iter().flatten() {
            if !result.mv_partitions.insert(mv.clone()) {
                continue;
            }
            pending_base.extend(
                mapping
                    .mv_to_base
                    .get(mv)
                    .into_iter()
                    .flatten()
                    .filter(|b| !result.base_partitions.contains(*b))
                    .cloned(),
            );
        }
    }

    result
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::NaiveDate;
    use datafusion_common::{Result, ScalarValue};
    use datafusion_expr::interval_arithmetic::Interval;

    use super::{
        compute_partition_diff, compute_partition_mapping, expand_potential_refresh,
        generate_partition_ref_map, PartitionRange, TimeGranularity,
    };

    fn int_range(lower: i64, upper: i64) -> PartitionRange {
        PartitionRange::try_new(ScalarValue::Int64(Some(lower)), ScalarValue::Int64(Some(upper))).unwrap()
    }

    fn date(s: &str) -> ScalarValue {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let days = date
            .signed_duration_since(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
            .num_days();
        ScalarValue::Date32(Some(days as i32))
    }

    fn date_range(lower: &str, upper: &str) -> PartitionRange {
        PartitionRange::try_new(date(lower), date(upper)).unwrap()
    }

    /// Daily partitions `pYYYYMMDD` for `[start, end)`.
    fn daily(start: &str, end: &str) -> BTreeMap<String, PartitionRange> {
        let mut day = NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap();
        let end = NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap();
        let mut partitions = BTreeMap::new();
        while day < end {
            let next = day.succ_opt().unwrap();
            partitions.insert(
                day.format("p%Y%m%d").to_string(),
                date_range(&day.to_string(), &next.to_string()),
            );
            day = next;
        }
        partitions
    }

    fn names<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        names.into_iter().map(String::from).collect()
    }

    #[test]
    fn ranges() -> Result<()> {
        assert!(PartitionRange::try_new(ScalarValue::Int64(Some(3)), ScalarValue::Int64(Some(3))).is_err());
        assert!(int_range(1, 10).intersects(&int_range(9, 20)));
        assert!(!int_range(1, 10).intersects(&int_range(10, 20)));
        assert!(PartitionRange::unbounded().intersects(&int_range(10, 20)));

        let closed = Interval::try_new(ScalarValue::Int64(Some(10)), ScalarValue::Int64(Some(12)))?;
        assert!(int_range(12, 20).intersects_interval(&closed));
        assert!(!int_range(1, 10).intersects_interval(&closed));
        assert!(!int_range(13, 20).intersects_interval(&closed));
        assert_eq!(int_range(1, 10).to_string(), "[1, 10)");

        Ok(())
    }

    #[test]
    fn time_buckets() -> Result<()> {
        let range = date_range("2024-01-30", "2024-02-02");
        let buckets = TimeGranularity::Month.buckets(&range)?;
        assert_eq!(
            buckets,
            vec![
                ("p202401".to_string(), date_range("2024-01-01", "2024-02-01")),
                ("p202402".to_string(), date_range("2024-02-01", "2024-03-01")),
            ]
        );

        let quarter = TimeGranularity::Quarter.buckets(&date_range("2024-05-05", "2024-05-06"))?;
        assert_eq!(
            quarter,
            vec![("p2024q2".to_string(), date_range("2024-04-01", "2024-07-01"))]
        );

        // 2024-01-17 is a Wednesday
        let week = TimeGranularity::Week.buckets(&date_range("2024-01-17", "2024-01-18"))?;
        assert_eq!(
            week,
            vec![("p20240115".to_string(), date_range("2024-01-15", "2024-01-22"))]
        );

        let hour = TimeGranularity::Hour.buckets(&PartitionRange::try_new(
            ScalarValue::TimestampSecond(Some(1_704_078_000), None),
            ScalarValue::TimestampSecond(Some(1_704_078_001), None),
        )?)?;
        assert_eq!(hour[0].0, "p2024010103");

        assert!(TimeGranularity::Hour.buckets(&date_range("2024-01-01", "2024-01-02")).is_err());
        assert!(TimeGranularity::Month.buckets(&PartitionRange::unbounded()).is_err());
        assert!(TimeGranularity::Month.buckets(&int_range(1, 2)).is_err());
        assert_eq!("Month".parse::<TimeGranularity>()?, TimeGranularity::Month);
        assert!("fortnight".parse::<TimeGranularity>().is_err());

        Ok(())
    }

    #[test]
    fn identity_diff() -> Result<()> {
        let base = BTreeMap::from([
            ("p1".to_string(), int_range(1, 10)),
            ("p2".to_string(), int_range(10, 20)),
        ]);
        let mv = BTreeMap::from([("p1".to_string(), int_range(1, 10))]);

        let diff = compute_partition_diff(&base, &mv, None)?;
        assert_eq!(diff.adds.keys().collect::<Vec<_>>(), vec!["p2"]);
        assert!(diff.deletes.is_empty());

        // a repartitioned base table drops the old partition
        let base = BTreeMap::from([("p1".to_string(), int_range(1, 20))]);
        let diff = compute_partition_diff(&base, &mv, None)?;
        assert_eq!(diff.adds, base);
        assert_eq!(diff.deletes, mv);

        assert!(compute_partition_diff(&mv, &mv, None)?.is_empty());

        Ok(())
    }

    #[test]
    fn rollup_diff_and_mapping() -> Result<()> {
        let base = daily("2024-01-01", "2024-02-01");
        let mv = BTreeMap::from([(
            "p202401".to_string(),
            date_range("2024-01-01", "2024-02-01"),
        )]);

        let mapping = compute_partition_mapping(&base, &mv, Some(TimeGranularity::Month))?;
        assert!(mapping.diff.is_empty());
        assert_eq!(mapping.mv_to_base["p202401"].len(), 31);

        let refresh = expand_potential_refresh(&mapping, [&"p20240115".to_string()]);
        assert_eq!(refresh.mv_partitions, names(["p202401"]));
        assert_eq!(refresh.base_partitions.len(), 31);

        // a new day in February adds a bucket without touching January
        let mut base = base;
        base.extend(daily("2024-02-01", "2024-02-02"));
        let mapping = compute_partition_mapping(&base, &mv, Some(TimeGranularity::Month))?;
        assert_eq!(mapping.diff.adds.keys().collect::<Vec<_>>(), vec!["p202402"]);
        let refresh = expand_potential_refresh(&mapping, [&"p20240201".to_string()]);
        assert_eq!(refresh.mv_partitions, names(["p202402"]));

        Ok(())
    }

    #[test]
    fn misaligned_partitions_are_rebuilt() -> Result<()> {
        let base = daily("2024-01-01", "2024-02-01");
        let mv = BTreeMap::from([(
            "p_custom".to_string(),
            date_range("2024-01-15", "2024-02-15"),
        )]);

        let diff = compute_partition_diff(&base, &mv, Some(TimeGranularity::Month))?;
        assert_eq!(diff.deletes, mv);
        assert_eq!(diff.adds.keys().collect::<Vec<_>>(), vec!["p202401"]);

        Ok(())
    }

    #[test]
    fn refresh_closure_crosses_straddling_partitions() -> Result<()> {
        let base = BTreeMap::from([
            ("a".to_string(), date_range("2024-01-01", "2024-01-20")),
            ("b".to_string(), date_range("2024-01-20", "2024-02-10")),
            ("c".to_string(), date_range("2024-02-10", "2024-03-01")),
            ("d".to_string(), date_range("2024-03-01", "2024-03-02")),
        ]);
        let mapping = compute_partition_mapping(&base, &BTreeMap::new(), Some(TimeGranularity::Month))?;
        assert_eq!(
            mapping.diff.adds.keys().collect::<Vec<_>>(),
            vec!["p202401", "p202402", "p202403"]
        );
        assert_eq!(mapping.base_to_mv["b"], names(["p202401", "p202402"]));

        let refresh = expand_potential_refresh(&mapping, [&"a".to_string()]);
        assert_eq!(refresh.mv_partitions, names(["p202401", "p202402"]));
        assert_eq!(refresh.base_partitions, names(["a", "b", "c"]));

        let refs = generate_partition_ref_map(&base, &BTreeMap::new());
        assert!(refs.values().all(BTreeSet::is_empty));

        Ok(())
    }
}
