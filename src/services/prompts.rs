//! Prompt construction for chapters and outlines, plus the offline samples.

use crate::models::{ChapterSpec, Outline, OutlineChapter};
use crate::services::llm::{GenerationRequest, Tier};

const HOOK_SYSTEM_PROMPT: &str = "You are a master storyteller and educator. Your specialty is creating \"Aha moments\": \
the instant a reader suddenly understands something in a new way.\n\n\
Your writing style is clear and conversational, rich with concrete examples, emotionally engaging and story-driven.";

const CHAPTER_SYSTEM_PROMPT: &str = "You are an expert ebook author who writes engaging, practical content.\n\n\
Your writing is clear and well-structured, rich with examples, actionable and readable.";

#[derive(Debug, Clone)]
pub struct ChapterPrompt {
    pub tier: Tier,
    pub system_prompt: String,
    pub prompt: String,
}

impl ChapterPrompt {
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            tier: self.tier,
            system_prompt: Some(self.system_prompt),
        }
    }
}

fn numbered(points: &[String]) -> String {
    points
        .iter()
        .enumerate()
        .map(|(i, point)| format!("{}. {}", i + 1, point))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds the prompt for chapter `number` (1-based). Hook chapters go to the
/// premium tier with the storytelling prompt; everything else uses the fast
/// tier.
pub fn chapter_prompt(book_title: &str, number: usize, spec: &ChapterSpec, hook: bool) -> ChapterPrompt {
    let key_points = numbered(&spec.key_points);
    let target = spec.target_length();

    match spec.aha_moment().filter(|_| hook) {
        Some(aha) => ChapterPrompt {
            tier: Tier::Premium,
            system_prompt: HOOK_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Write the first chapter of an ebook that will create an immediate \"Aha moment\" for readers.\n\n\
<book_title>{book_title}</book_title>\n\
<chapter_title>{title}</chapter_title>\n\
<target_words>{target}</target_words>\n\n\
<aha_moment>\nThe key insight readers must experience: {aha}\n</aha_moment>\n\n\
<key_points>\n{key_points}\n</key_points>\n\n\
<writing_instructions>\n\
1. Hook immediately with a surprising fact, question or scenario.\n\
2. Build towards the Aha moment.\n\
3. Use concrete examples and a story that illustrates the concept.\n\
4. End by showing readers how their understanding has changed.\n\
</writing_instructions>\n\n\
Write the complete chapter in markdown format.",
                title = spec.title,
            ),
        },
        None if hook => ChapterPrompt {
            tier: Tier::Premium,
            system_prompt: HOOK_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Write the opening chapter of the ebook \"{book_title}\". Hook the reader from the first sentence.\n\n\
<chapter_title>{title}</chapter_title>\n\
<target_words>{target}</target_words>\n\n\
<key_points>\n{key_points}\n</key_points>\n\n\
Write the complete chapter in markdown format.",
                title = spec.title,
            ),
        },
        None => ChapterPrompt {
            tier: Tier::Fast,
            system_prompt: CHAPTER_SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Write Chapter {number} for the ebook \"{book_title}\".\n\n\
<chapter_title>{title}</chapter_title>\n\
<target_words>{target}</target_words>\n\n\
<key_points>\n{key_points}\n</key_points>\n\n\
<requirements>\n\
- Write approximately {target} characters\n\
- Include practical examples and real-world scenarios\n\
- Structure with sections and subsections, an introduction and a conclusion\n\
</requirements>\n\n\
Write the complete chapter content in markdown format.",
                title = spec.title,
            ),
        },
    }
}

pub fn outline_prompt(topic: &str, description: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: format!(
            "Create a detailed outline for an ebook about:\n\
Topic: {topic}\n\
Description: {description}\n\n\
Generate a compelling title and 8-12 chapters, each with 3-5 key points and an estimated word count.\n\n\
Respond with JSON only:\n\
{{\"title\": \"Book Title\", \"chapters\": [{{\"number\": 1, \"title\": \"Chapter Title\", \"keyPoints\": [\"point1\"], \"estimatedWords\": 2500}}]}}"
        ),
        tier: Tier::Fast,
        system_prompt: None,
    }
}

/// Parses a model reply into an outline, falling back to an empty outline
/// titled after the topic.
pub fn parse_outline(topic: &str, reply: &str) -> Outline {
    let json = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply,
    };
    serde_json::from_str(json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "outline reply was not valid JSON");
        Outline {
            title: topic.to_string(),
            chapters: Vec::new(),
        }
    })
}

pub fn sample_outline(topic: &str) -> Outline {
    const STAGES: [&str; 10] = [
        "Introduction",
        "Foundations",
        "Core Concepts",
        "Putting It to Work",
        "Advanced Techniques",
        "Troubleshooting",
        "Optimization",
        "Case Studies",
        "Looking Ahead",
        "Wrapping Up",
    ];

    Outline {
        title: format!("{topic}: The Complete Guide"),
        chapters: STAGES
            .iter()
            .enumerate()
            .map(|(i, stage)| OutlineChapter {
                number: i + 1,
                title: format!("Chapter {}: {stage}", i + 1),
                key_points: (1..=3).map(|n| format!("{stage} key point {n}")).collect(),
                estimated_words: 2000 + (i as u32 * 150),
            })
            .collect(),
    }
}

fn extract_tag<'a>(prompt: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = prompt.find(&open)? + open.len();
    let end = prompt[start..].find(&close)? + start;
    Some(prompt[start..end].trim())
}

/// Deterministic chapter body built from the tags of a chapter prompt.
pub fn sample_chapter(prompt: &str) -> String {
    let title = extract_tag(prompt, "chapter_title").unwrap_or("Untitled Chapter");
    let points: Vec<&str> = extract_tag(prompt, "key_points")
        .map(|block| {
            block
                .lines()
                .map(|line| line.split_once(". ").map_or(line, |(_, point)| point).trim())
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut text = format!("# {title}\n\n## Introduction\n\nWelcome to {title}.");
    if !points.is_empty() {
        text.push_str(&format!(" This chapter covers {}.", points.join(", ")));
    }
    text.push('\n');

    for point in &points {
        text.push_str(&format!(
            "\n## {point}\n\n{point} is one of the core ideas of this chapter. \
Understanding it makes everything that follows easier.\n\n\
**Key takeaways:**\n- What {point} means\n- Where it applies\n- How to practise it\n"
        ));
    }

    text.push_str(
        "\n## Summary\n\nYou now have the groundwork for the next chapter. \
Review the key points above before moving on.\n\n---\n\n\
*Sample content generated without a language model.*\n",
    );
    text
}
