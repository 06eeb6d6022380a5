/// Seconds of audio covered by one silence-detection window.
pub const SILENCE_WINDOW_SECS: f64 = 0.1;

/// Check if a window of samples is silence by RMS amplitude.
pub fn is_silence_window(samples: &[f32], threshold: f32) -> bool {
    if samples.is_empty() {
        return true;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    rms < threshold
}

/// Find silence runs lasting at least `min_silence_secs`.
/// Returns (start_sample, end_sample) pairs.
pub fn find_silence_runs(
    samples: &[f32],
    sample_rate: u32,
    threshold: f32,
    min_silence_secs: f64,
) -> Vec<(usize, usize)> {
    let window_size = ((sample_rate as f64 * SILENCE_WINDOW_SECS) as usize).max(1);
    let min_silence_samples = (min_silence_secs * sample_rate as f64) as usize;

    let mut runs = Vec::new();
    let mut in_silence = false;
    let mut silence_start = 0;

    let mut i = 0;
    while i < samples.len() {
        let window_end = (i + window_size).min(samples.len());
        let is_silent = is_silence_window(&samples[i..window_end], threshold);

        if is_silent && !in_silence {
            in_silence = true;
            silence_start = i;
        } else if !is_silent && in_silence {
            in_silence = false;
            if i - silence_start >= min_silence_samples {
                runs.push((silence_start, i));
            }
        }

        i += window_size;
    }

    if in_silence && samples.len() - silence_start >= min_silence_samples {
        runs.push((silence_start, samples.len()));
    }

    runs
}

/// Candidate cut points in seconds: the midpoint of every qualifying
/// silence run.
pub fn silence_cut_candidates(
    samples: &[f32],
    sample_rate: u32,
    threshold: f32,
    min_silence_secs: f64,
) -> Vec<f64> {
    find_silence_runs(samples, sample_rate, threshold, min_silence_secs)
        .into_iter()
        .map(|(start, end)| {
            let midpoint = start + (end - start) / 2;
            midpoint as f64 / sample_rate as f64
        })
        .collect()
}
