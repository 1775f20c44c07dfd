use std::path::{Path, PathBuf};
use std::sync::Arc;

use cpboard_adapters::{
    adapter_for_source, leetcode_query_url, AdapterContext, CodechefConfig, CodeforcesConfig,
    Credentials, GfgContestConfig, GfgPracticeConfig, HackerrankConfig, LeetcodeConfig, SourceConfig,
};
use cpboard_core::{RatingColumn, ScrapeTarget};
use cpboard_storage::{ManualClock, ScriptedTransport};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_path(source: &str, name: &str) -> PathBuf {
    workspace_root().join("fixtures").join(source).join("sample").join(name)
}

fn fixture(source: &str, name: &str) -> String {
    let path = fixture_path(source, name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

async fn replay(
    config: SourceConfig,
    transport: ScriptedTransport,
    targets: &[(&str, &str)],
) -> Vec<(String, i64)> {
    let column = config.column();
    let adapter = adapter_for_source(&config);
    assert_eq!(adapter.column(), column);

    let ctx = AdapterContext::new(
        Arc::new(transport),
        Arc::new(ManualClock::new()),
        Credentials::default(),
    );
    let targets: Vec<ScrapeTarget> = targets
        .iter()
        .map(|(handle, id)| ScrapeTarget::new(*handle, *id))
        .collect();
    adapter
        .fetch_ratings(&ctx, &targets)
        .await
        .expect("fixture scrape")
        .into_iter()
        .map(|o| {
            assert_eq!(o.column, column);
            (o.handle, o.rating)
        })
        .collect()
}

#[tokio::test]
async fn codeforces_fixture_resolves_rated_and_unrated_users() {
    let transport = ScriptedTransport::new().ok(
        "https://cf.test/api/user.info?handles=cf_stu1%3Bcf_stu2",
        fixture("codeforces", "user_info.json"),
    );
    let config = SourceConfig::Codeforces(CodeforcesConfig {
        base_url: "https://cf.test/api".into(),
        ..CodeforcesConfig::default()
    });
    let got = replay(config, transport, &[("stu1", "cf_stu1"), ("stu2", "cf_stu2")]).await;
    assert_eq!(got, vec![("stu1".into(), 1512), ("stu2".into(), 0)]);
}

#[tokio::test]
async fn leetcode_fixture_rounds_contest_rating() {
    let base = "https://lc.test/graphql";
    let transport = ScriptedTransport::new().ok(
        leetcode_query_url(base, "lc_stu1"),
        fixture("leetcode", "contest_ranking.json"),
    );
    let config = SourceConfig::Leetcode(LeetcodeConfig {
        base_url: base.into(),
        ..LeetcodeConfig::default()
    });
    let got = replay(config, transport, &[("stu1", "lc_stu1")]).await;
    assert_eq!(got, vec![("stu1".into(), 1687)]);
}

#[tokio::test]
async fn codechef_fixture_reads_current_rating() {
    let transport =
        ScriptedTransport::new().ok("https://cc.test/cc_stu1", fixture("codechef", "profile.json"));
    let config = SourceConfig::Codechef(CodechefConfig {
        base_url: "https://cc.test".into(),
        ..CodechefConfig::default()
    });
    let got = replay(config, transport, &[("stu1", "cc_stu1")]).await;
    assert_eq!(got, vec![("stu1".into(), 1642)]);
}

#[tokio::test]
async fn gfg_contest_fixture_stops_at_zero_score() {
    let transport = ScriptedTransport::new().ok(
        "https://gfg.test/leaderboard?page=1",
        fixture("gfg_contest", "leaderboard_page_1.json"),
    );
    let config = SourceConfig::GfgContest(GfgContestConfig {
        base_url: "https://gfg.test/leaderboard?page=".into(),
        ..GfgContestConfig::default()
    });
    let got = replay(
        config,
        transport,
        &[("stu1", "gfg_stu1"), ("stu2", "gfg_stu2"), ("stu3", "gfg_stu3")],
    )
    .await;
    assert_eq!(got, vec![("stu1".into(), 2210), ("stu2".into(), 950)]);
}

#[tokio::test]
async fn gfg_practice_fixture_uses_profile_page_for_missing_handles() {
    let transport = ScriptedTransport::new()
        .ok(
            "https://gfg.test/stats?page_size=100000&page=1",
            fixture("gfg_practice", "institute_stats.json"),
        )
        .ok("https://gfg.test/user/gfg_stu2", fixture("gfg_practice", "profile.html"));
    let config = SourceConfig::GfgPractice(GfgPracticeConfig {
        base_url: "https://gfg.test/stats".into(),
        profile_base_url: "https://gfg.test/user".into(),
        ..GfgPracticeConfig::default()
    });
    let got = replay(config, transport, &[("stu1", "gfg_stu1"), ("stu2", "gfg_stu2")]).await;
    assert_eq!(got, vec![("stu1".into(), 812), ("stu2".into(), 417)]);
}

#[tokio::test]
async fn hackerrank_fixture_sums_trackers_listed_in_file() {
    let page = fixture("hackerrank", "leaderboard.json");
    let transport = ScriptedTransport::new()
        .ok("https://hr.test/rest/contests/cmrit25-1-basics/leaderboard?offset=0&limit=100", page.clone())
        .ok("https://hr.test/rest/contests/cmrit25-2-ds/leaderboard?offset=0&limit=100", page)
        .ok("https://hr.test/rest/contests/cmrit25-1-basics/leaderboard?offset=100&limit=100", r#"{"models":[]}"#)
        .ok("https://hr.test/rest/contests/cmrit25-2-ds/leaderboard?offset=100&limit=100", r#"{"models":[]}"#);
    let config = SourceConfig::Hackerrank(HackerrankConfig {
        base_url: "https://hr.test/rest/contests".into(),
        tracker_file: Some(fixture_path("hackerrank", "trackers.txt")),
        ..HackerrankConfig::default()
    });
    let got = replay(
        config,
        transport,
        &[("stu1", "hr_stu1"), ("stu2", "hr_stu2"), ("stu3", "hr_stu3")],
    )
    .await;
    assert_eq!(got, vec![("stu1".into(), 600), ("stu2".into(), 350)]);
}

#[test]
fn every_column_has_an_adapter() {
    for column in RatingColumn::ALL {
        let adapter = adapter_for_source(&SourceConfig::default_for(column));
        assert_eq!(adapter.column(), column);
    }
}
