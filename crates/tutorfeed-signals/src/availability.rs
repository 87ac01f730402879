use chrono::NaiveTime;
use regex::{Captures, Regex};
use tutorfeed_core::TimeWindow;

const WEEKDAYS: [&str; 5] = ["Mon", "Tue", "Wed", "Thu", "Fri"];
const WEEKEND: [&str; 2] = ["Sat", "Sun"];

#[derive(Debug)]
pub(crate) struct AvailabilityParser {
    day: Regex,
    range: Regex,
    after: Regex,
    before: Regex,
    part_of_day: Regex,
}

fn clock(hour: &str, minute: Option<&str>, meridiem: &str) -> Option<NaiveTime> {
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.map_or(Ok(0), |m| m.parse::<u32>()).ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let hour24 = match (meridiem, hour) {
        ("am", 12) => 0,
        ("am", h) => h,
        ("pm", 12) => 12,
        (_, h) => h + 12,
    };
    NaiveTime::from_hms_opt(hour24, minute, 0)
}

fn day_label(word: &str) -> Vec<&'static str> {
    if word.starts_with("weekday") {
        return WEEKDAYS.to_vec();
    }
    if word.starts_with("weekend") {
        return WEEKEND.to_vec();
    }
    let label = match word.get(..2) {
        Some("mo") => "Mon",
        Some("tu") => "Tue",
        Some("we") => "Wed",
        Some("th") => "Thu",
        Some("fr") => "Fri",
        Some("sa") => "Sat",
        Some("su") => "Sun",
        _ => return Vec::new(),
    };
    vec![label]
}

impl AvailabilityParser {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            day: Regex::new(
                r"\b(mon(?:day)?s?|tue(?:s(?:day)?)?s?|wed(?:nesday)?s?|thu(?:r(?:s(?:day)?)?)?s?|fri(?:day)?s?|sat(?:urday)?s?|sun(?:day)?s?|weekdays?|weekends?)\b",
            )?,
            range: Regex::new(
                r"\b(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)?\s*(?:-|–|to)\s*(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)\b",
            )?,
            after: Regex::new(r"\b(?:after|from)\s+(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)\b")?,
            before: Regex::new(r"\b(?:before|by|until|till)\s+(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)\b")?,
            part_of_day: Regex::new(r"\b(mornings?|afternoons?|evenings?|nights?|flexible)\b")?,
        })
    }

    fn range_times(caps: &Captures<'_>) -> (Option<NaiveTime>, Option<NaiveTime>) {
        let end_meridiem = caps.get(6).map_or("pm", |m| m.as_str());
        let end = clock(&caps[4], caps.get(5).map(|m| m.as_str()), end_meridiem);
        let start = match caps.get(3) {
            Some(m) => clock(&caps[1], caps.get(2).map(|m| m.as_str()), m.as_str()),
            // "11-1pm": an inherited meridiem that would put start after end flips to am.
            None => clock(&caps[1], caps.get(2).map(|m| m.as_str()), end_meridiem)
                .filter(|s| end.map_or(true, |e| *s <= e))
                .or_else(|| clock(&caps[1], caps.get(2).map(|m| m.as_str()), "am")),
        };
        (start, end)
    }

    /// One window per line that names days, clock times or a part of the day.
    pub(crate) fn parse(&self, text: &str) -> Vec<TimeWindow> {
        let mut windows = Vec::new();
        for line in text.lines() {
            let lowered = line.to_ascii_lowercase();

            let mut days: Vec<String> = Vec::new();
            for m in self.day.find_iter(&lowered) {
                for label in day_label(m.as_str()) {
                    if !days.iter().any(|d| d == label) {
                        days.push(label.to_string());
                    }
                }
            }

            let (mut start, mut end) = (None, None);
            if let Some(caps) = self.range.captures(&lowered) {
                (start, end) = Self::range_times(&caps);
            } else {
                if let Some(caps) = self.after.captures(&lowered) {
                    start = clock(&caps[1], caps.get(2).map(|m| m.as_str()), &caps[3]);
                }
                if let Some(caps) = self.before.captures(&lowered) {
                    end = clock(&caps[1], caps.get(2).map(|m| m.as_str()), &caps[3]);
                }
            }

            let has_part_of_day = self.part_of_day.is_match(&lowered);
            if days.is_empty() && start.is_none() && end.is_none() && !has_part_of_day {
                continue;
            }
            windows.push(TimeWindow {
                days,
                start,
                end,
                note: line.trim().to_string(),
            });
        }
        windows
    }
}
