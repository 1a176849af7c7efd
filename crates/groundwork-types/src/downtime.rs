//! Merging of downtime windows.

use chrono::{DateTime, Utc};

/// A downtime window: when a system went down, and when it came back up.
pub type Window = (DateTime<Utc>, DateTime<Utc>);

/// Merges any number of downtime logs into one.
///
/// The result is sorted by window start, with overlapping or touching windows
/// combined into a single window.
pub fn merge<I>(logs: I) -> Vec<Window>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = Window>,
{
    let mut all: Vec<Window> = logs.into_iter().flatten().collect();
    all.sort_by_key(|&(start, _)| start);

    let mut merged: Vec<Window> = Vec::with_capacity(all.len());
    for (start, end) in all {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end => {
                if end > *last_end {
                    *last_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn window(start: i64, end: i64) -> Window {
        (at(start), at(end))
    }

    #[test]
    fn test_empty() {
        assert_eq!(merge(Vec::<Vec<Window>>::new()), vec![]);
        assert_eq!(merge([Vec::<Window>::new(), Vec::new()]), vec![]);
    }

    #[test]
    fn test_disjoint_windows_are_kept() {
        let logs = [vec![window(0, 10), window(20, 30)]];
        assert_eq!(merge(logs), vec![window(0, 10), window(20, 30)]);
    }

    #[test]
    fn test_overlapping_windows_are_combined() {
        let logs = [vec![window(0, 15), window(10, 30)]];
        assert_eq!(merge(logs), vec![window(0, 30)]);
    }

    #[test]
    fn test_touching_windows_are_combined() {
        let logs = [vec![window(0, 10), window(10, 20)]];
        assert_eq!(merge(logs), vec![window(0, 20)]);
    }

    #[test]
    fn test_contained_window_is_absorbed() {
        let logs = [vec![window(0, 100), window(25, 50)]];
        assert_eq!(merge(logs), vec![window(0, 100)]);
    }

    #[test]
    fn test_unsorted_multi_source_input() {
        let logs = [
            vec![window(40, 50), window(0, 5)],
            vec![window(3, 10)],
            vec![window(45, 60), window(70, 80)],
        ];
        assert_eq!(
            merge(logs),
            vec![window(0, 10), window(40, 60), window(70, 80)]
        );
    }
}
