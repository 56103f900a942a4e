use indicatif::ProgressStyle;

/// Progress bar in the style
/// `<prefix> #### <pos>/<len> generations, <message>`
pub fn generation_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:.bold.dim} {bar:.cyan/blue} {human_pos}/{human_len} generations, {wide_msg}",
    )
    .unwrap()
}

/// Spinner in the style
/// `<prefix> . <message>`
pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {wide_msg}")
        .unwrap()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
}
