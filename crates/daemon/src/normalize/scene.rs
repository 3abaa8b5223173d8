//! Scene-cut detection for content-adaptive trimming.

/// Scene score above which a frame counts as a cut.
pub const SCENE_THRESHOLD: f64 = 0.3;

/// The `-vf` argument that logs one `showinfo` line per detected cut.
pub fn scene_filter() -> String {
    format!("select='gt(scene,{})',showinfo", SCENE_THRESHOLD)
}

/// Extracts `pts_time` values from ffmpeg `showinfo` log output.
pub fn parse_showinfo(stderr: &str) -> Vec<f64> {
    let mut cuts: Vec<f64> = stderr
        .lines()
        .filter(|line| line.contains("showinfo"))
        .filter_map(|line| {
            let rest = line.split("pts_time:").nth(1)?;
            rest.split_whitespace().next()?.parse::<f64>().ok()
        })
        .filter(|t| t.is_finite() && *t >= 0.0)
        .collect();
    cuts.sort_by(f64::total_cmp);
    cuts
}

/// Start of the `window`-second span of the source containing the most cuts.
///
/// Candidate starts are zero and every cut, clamped so the window fits.
/// Ties go to the earliest start. Returns `None` when there are no cuts or
/// the source is not longer than the window.
pub fn densest_window(cuts: &[f64], source_duration: f64, window: f64) -> Option<f64> {
    if cuts.is_empty() || source_duration <= window {
        return None;
    }
    let latest = source_duration - window;

    let mut best: Option<(usize, f64)> = None;
    for start in std::iter::once(0.0).chain(cuts.iter().copied()) {
        let start = start.clamp(0.0, latest);
        let end = start + window;
        let count = cuts.iter().filter(|&&t| t >= start && t < end).count();

        match best {
            Some((best_count, best_start))
                if count < best_count || (count == best_count && start >= best_start) => {}
            _ => best = Some((count, start)),
        }
    }

    best.map(|(_, start)| start)
}
