/// Compiles a regex once and returns a static reference.
macro_rules! static_regex {
    ($pat:expr) => {{
        static RE: ::std::sync::OnceLock<::regex::Regex> = ::std::sync::OnceLock::new();
        RE.get_or_init(|| ::regex::Regex::new($pat).expect("static regex must compile"))
    }};
}
