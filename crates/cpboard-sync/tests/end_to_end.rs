use std::path::Path;
use std::sync::Arc;

use cpboard_adapters::{
    AdapterContext, CodechefConfig, CodeforcesConfig, Credentials, SourceConfig, SourceRegistry,
    VerifierConfig,
};
use cpboard_core::{
    format_percentile, MissingColumnPolicy, Platform, RatingColumn, ScoringWeights, ScrapeTarget,
};
use cpboard_storage::{ManualClock, ParticipantStore, ScriptedTransport};
use cpboard_sync::{BoardConfig, BoardPipeline};

const ROSTER: &str = "Handle,GeeksForGeeks Handle,Codeforces Handle,LeetCode Handle,CodeChef Handle,HackerRank Handle,GeeksForGeeks URL Exists,Codeforces URL Exists,LeetCode URL Exists,CodeChef URL Exists,HackerRank URL Exists
stu1,,cf_stu1,,cc_stu1,,false,true,false,true,false
";

const CF_OK: &str = r#"{"status":"OK","result":[{"handle":"cf_stu1","rating":1500}]}"#;

fn registry() -> SourceRegistry {
    SourceRegistry {
        sources: vec![
            SourceConfig::Codechef(CodechefConfig {
                base_url: "https://cc.test".into(),
                ..CodechefConfig::default()
            }),
            SourceConfig::Codeforces(CodeforcesConfig {
                base_url: "https://cf.test/api".into(),
                min_interval_ms: 0,
                ..CodeforcesConfig::default()
            }),
        ],
        verifier: VerifierConfig {
            codeforces_profile_url: "https://cf.test/profile".into(),
            codechef_profile_url: "https://cc.test/users".into(),
            hackerrank_profile_url: "https://hr.test/profile".into(),
            ..VerifierConfig::default()
        },
    }
}

async fn pipeline(root: &Path, transport: ScriptedTransport, weights: ScoringWeights) -> BoardPipeline {
    let config = BoardConfig::rooted_at(root);
    std::fs::create_dir_all(config.roster_path.parent().expect("roster dir")).expect("mkdir");
    std::fs::write(&config.roster_path, ROSTER).expect("write roster");

    let store = ParticipantStore::in_memory().await.expect("store");
    let ctx = AdapterContext::new(
        Arc::new(transport),
        Arc::new(ManualClock::new()),
        Credentials::default(),
    );
    BoardPipeline::new(config, store, registry(), weights, ctx).expect("pipeline")
}

#[tokio::test]
async fn single_codeforces_rating_publishes_full_percentile() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new().ok("https://cf.test/api/user.info?handles=cf_stu1", CF_OK);
    let pipeline = pipeline(dir.path(), transport, ScoringWeights::default()).await;

    let roster = pipeline.load_roster().await.expect("roster");
    assert_eq!(roster.participants, 1);

    let scrape = pipeline.scrape(RatingColumn::Codeforces).await.expect("scrape");
    assert_eq!((scrape.targets, scrape.observed), (1, 1));
    let ratings_file = std::fs::read_to_string(dir.path().join("ratings/codeforces_ratings.txt"))
        .expect("ratings file");
    assert_eq!(ratings_file, "stu1,cf_stu1,1500\n");

    let stored = pipeline.store().ratings().await.expect("ratings");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].rating, 1500);

    let board = pipeline.build_leaderboard().await.expect("leaderboard");
    assert_eq!(board.rows.len(), 1);
    assert_eq!(board.rows[0].record.percentile.map(format_percentile).as_deref(), Some("100.00"));

    let csv = std::fs::read_to_string(dir.path().join("leaderboards/leaderboard.csv")).expect("csv");
    assert_eq!(csv.lines().nth(1), Some("1,stu1,cf_stu1,1500,,,,,,cc_stu1,,,,100.00"));
    assert!(dir.path().join("leaderboards/leaderboard.md").exists());
    assert!(dir.path().join("leaderboards/leaderboard.parquet").exists());
    assert!(dir.path().join("leaderboards/manifest.json").exists());

    let stored_board = pipeline.store().leaderboard().await.expect("stored leaderboard");
    assert_eq!(stored_board[0].rating(RatingColumn::Codeforces), Some(1500));
}

#[tokio::test]
async fn fixed_policy_keeps_configured_weight() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new().ok("https://cf.test/api/user.info?handles=cf_stu1", CF_OK);
    let weights = ScoringWeights {
        missing_column_policy: MissingColumnPolicy::Fixed,
        ..ScoringWeights::default()
    };
    let pipeline = pipeline(dir.path(), transport, weights).await;
    pipeline.load_roster().await.expect("roster");
    pipeline.scrape(RatingColumn::Codeforces).await.expect("scrape");

    let board = pipeline.build_leaderboard().await.expect("leaderboard");
    assert_eq!(board.rows[0].record.percentile.map(format_percentile).as_deref(), Some("30.00"));
}

#[tokio::test]
async fn rebuilding_without_new_data_is_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new().ok("https://cf.test/api/user.info?handles=cf_stu1", CF_OK);
    let pipeline = pipeline(dir.path(), transport, ScoringWeights::default()).await;
    pipeline.load_roster().await.expect("roster");
    pipeline.scrape(RatingColumn::Codeforces).await.expect("scrape");

    let first = pipeline.build_leaderboard().await.expect("first");
    let second = pipeline.build_leaderboard().await.expect("second");
    assert_eq!(first.published.csv.content_hash, second.published.csv.content_hash);
    assert!(second.published.csv.unchanged);
}

#[tokio::test]
async fn exhausted_codeforces_aborts_all_but_keeps_earlier_columns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new()
        .ok(
            "https://cc.test/cc_stu1",
            r#"{"success":true,"currentRating":1642}"#,
        )
        .status("https://cf.test/api/user.info", 503, "busy");
    let pipeline = pipeline(dir.path(), transport, ScoringWeights::default()).await;
    pipeline.load_roster().await.expect("roster");

    let err = pipeline.scrape_all().await.expect_err("codeforces must exhaust");
    assert!(format!("{err:#}").contains("codeforces"));

    let stored = pipeline.store().ratings().await.expect("ratings");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].column, RatingColumn::Codechef);
    assert_eq!(stored[0].rating, 1642);
}

#[tokio::test]
async fn failed_rescrape_leaves_previous_ratings_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new().ok("https://cf.test/api/user.info?handles=cf_stu1", CF_OK);
    let pipeline = pipeline(dir.path(), transport, ScoringWeights::default()).await;
    pipeline.load_roster().await.expect("roster");
    pipeline.scrape(RatingColumn::Codeforces).await.expect("scrape");

    // Same store, new transport that only ever answers 503.
    let config = BoardConfig::rooted_at(dir.path());
    let ctx = AdapterContext::new(
        Arc::new(ScriptedTransport::new().status("https://cf.test/api/user.info", 503, "busy")),
        Arc::new(ManualClock::new()),
        Credentials::default(),
    );
    let failing = BoardPipeline::new(
        config,
        pipeline.store().clone(),
        registry(),
        ScoringWeights::default(),
        ctx,
    )
    .expect("pipeline");
    assert!(failing.scrape(RatingColumn::Codeforces).await.is_err());

    let stored = failing.store().ratings().await.expect("ratings");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].rating, 1500);
}

#[tokio::test]
async fn verify_handles_rewrites_flags_and_feeds_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new()
        .ok("https://cf.test/profile/cf_stu1", "<html></html>")
        .redirect("https://cf.test/profile/ghost", "https://cf.test/")
        .ok("https://cc.test/users/cc_stu1", "<html></html>")
        .ok("https://hr.test/profile/hr_stu2", "<html></html>");
    let pipeline = pipeline(dir.path(), transport, ScoringWeights::default()).await;
    std::fs::write(
        &pipeline.config().roster_path,
        "Handle,GeeksForGeeks Handle,Codeforces Handle,LeetCode Handle,CodeChef Handle,HackerRank Handle\n\
         stu1,#N/A,cf_stu1,,cc_stu1,\n\
         stu2,,ghost,,,@hr_stu2\u{a0}\n",
    )
    .expect("write roster");

    let summary = pipeline.verify_handles().await.expect("verify");
    assert_eq!((summary.participants, summary.checked, summary.found), (2, 4, 3));

    let roster = std::fs::read_to_string(&pipeline.config().roster_path).expect("roster");
    let lines: Vec<&str> = roster.lines().skip(1).collect();
    assert_eq!(
        lines,
        vec![
            "stu1,#N/A,cf_stu1,#N/A,cc_stu1,#N/A,False,True,False,True,False",
            "stu2,#N/A,ghost,#N/A,#N/A,hr_stu2,False,False,False,False,True",
        ]
    );

    let cf = pipeline.store().scrape_targets(Platform::Codeforces).await.expect("cf");
    assert_eq!(cf, vec![ScrapeTarget::new("stu1", "cf_stu1")]);
    let hr = pipeline.store().scrape_targets(Platform::Hackerrank).await.expect("hr");
    assert_eq!(hr, vec![ScrapeTarget::new("stu2", "hr_stu2")]);
}
