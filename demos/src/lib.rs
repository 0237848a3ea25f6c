//! Test-paper workloads for the TeaTeach backend, built on `trapeze`.
use clap::ValueEnum;
use serde_json::{json, Value};
use trapeze::prelude::*;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Script {
    /// Generate a paper, then list papers.
    GeneratePaper,
    /// Preview, generate, then list papers.
    GenerateTestPapers,
}

impl Script {
    pub fn transaction(self, base: &str) -> TransactionSpec {
        match self {
            Script::GeneratePaper => generate_paper(base),
            Script::GenerateTestPapers => generate_test_papers(base),
        }
    }

    fn paper_name(self) -> &'static str {
        match self {
            Script::GeneratePaper => "python",
            Script::GenerateTestPapers => "python基础测试",
        }
    }

    fn total_score(self) -> u32 {
        match self {
            Script::GeneratePaper => 100,
            Script::GenerateTestPapers => 10,
        }
    }
}

/// Request body shared by the preview and generate endpoints.
pub fn generate_request(paper_name: &str, total_score: u32) -> Value {
    json!({
        "paperName": paper_name,
        "courseId": 3,
        "generationMethod": "BY_KNOWLEDGE_POINT",
        "totalQuestions": 20,
        "durationMinutes": 60,
        "totalScore": total_score,
        "questionTypes": ["SINGLE_CHOICE", "SHORT_ANSWER"],
        "knowledgePointIds": [],
        "knowledgePointQuestionCounts": {},
        "difficultyQuestionCounts": { "EASY": 0, "MEDIUM": 0, "HARD": 0 },
        "difficultyWeights": { "EASY": 0, "MEDIUM": 0, "HARD": 0 },
    })
}

fn list_papers(base: &str) -> TaskSpec {
    TaskSpec::get(format!("{base}/api/test-papers"))
        .name("list")
        .query("page", "0")
        .query("size", "12")
        .query("search", "")
}

pub fn generate_paper(base: &str) -> TransactionSpec {
    let script = Script::GeneratePaper;
    TransactionSpec::new("generate_paper")
        .task(
            TaskSpec::post(format!("{base}/api/test-papers/generate"))
                .name("generate")
                .json(generate_request(script.paper_name(), script.total_score())),
        )
        .task(list_papers(base))
}

pub fn generate_test_papers(base: &str) -> TransactionSpec {
    let script = Script::GenerateTestPapers;
    let body = generate_request(script.paper_name(), script.total_score());
    TransactionSpec::new("Generate_test_papers")
        .task(
            TaskSpec::post(format!("{base}/api/test-papers/preview"))
                .name("preview")
                .json(body.clone()),
        )
        .task(
            TaskSpec::post(format!("{base}/api/test-papers/generate"))
                .name("generate")
                .json(body),
        )
        .task(list_papers(base))
}

/// Scenario with the browser headers the web client sends.
///
/// `origin` is the address of the web front end, used for `Origin` and `Referer`.
pub fn scenario(
    script: Script,
    base: &str,
    origin: Option<&str>,
    token: &str,
) -> Result<Scenario, ConfigError> {
    let base = base.trim_end_matches('/');
    let mut builder = Scenario::builder("test_papers")
        .header("Accept", "application/json, text/plain, */*")
        .header("Accept-Language", "zh-CN,zh;q=0.9")
        .header("User-Agent", USER_AGENT)
        .bearer_token(token);

    if let Some(origin) = origin {
        let origin = origin.trim_end_matches('/');
        builder = builder
            .header("Origin", origin)
            .header("Referer", format!("{origin}/"));
    }

    let action = Action::builder("papers")
        .transaction(1, script.transaction(base))
        .build()?;
    builder.action(1, action).build()
}
