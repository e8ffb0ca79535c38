//! Ordered selector strategies for locating post body and comments.
//!
//! A strategy list is data: each [`SelectorRule`] pairs a CSS selector with an
//! acceptance predicate over the node's text. [`select_body`] walks the list
//! in order and stops at the first rule that yields an accepted node. New
//! page layouts are supported by adding rules, not by changing control flow.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::classify::{is_access_wall, is_profile_or_list};

/// One selector with its acceptance predicate.
pub struct SelectorRule {
    pub name: &'static str,
    pub selector: Selector,
    pub accept: fn(&str) -> Verdict,
}

/// Outcome of the acceptance predicate for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Looks like a profile or listing page; usable only as a last resort.
    Listing,
    Reject,
}

/// Default body predicate: reject access walls, demote listing pages.
#[must_use]
pub fn body_verdict(text: &str) -> Verdict {
    if text.trim().is_empty() || is_access_wall(text) {
        Verdict::Reject
    } else if is_profile_or_list(text) {
        Verdict::Listing
    } else {
        Verdict::Accept
    }
}

fn rule(name: &'static str, css: &str) -> SelectorRule {
    SelectorRule {
        name,
        selector: Selector::parse(css).unwrap(),
        accept: body_verdict,
    }
}

/// Body containers, most specific first.
pub static BODY_RULES: LazyLock<Vec<SelectorRule>> = LazyLock::new(|| {
    vec![
        rule("smart-editor", ".se-main-container"),
        rule("content-renderer", ".ContentRenderer"),
        rule("article-viewer", ".article_viewer"),
        rule("legacy-post-view", "#postViewArea"),
        rule("legacy-tbody", "#tbody"),
        rule("mobile-post", "#postContent, .post_cont"),
        rule("article-container", ".article_container"),
        rule("article", "article"),
        rule("main", "main"),
        rule("body", "body"),
    ]
});

/// CSS matching one comment item each, shared with the live-page helpers.
pub const COMMENT_ITEM_CSS: &str =
    "li.CommentItem, ul.comment_list > li, .u_cbox_comment, .comment_area .comment_item";

static COMMENT_ITEM: LazyLock<Selector> = LazyLock::new(|| Selector::parse(COMMENT_ITEM_CSS).unwrap());

/// Text node of a comment inside its item.
static COMMENT_TEXT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".comment_text_view, .text_comment, .u_cbox_contents, .comment_text").unwrap()
});

/// Body text chosen by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyMatch {
    pub rule: &'static str,
    pub text: String,
    /// The text only passed as a listing-page fallback.
    pub listing: bool,
}

/// Visible text of a node, one line per non-empty text run.
#[must_use]
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run the rules in order over a document.
///
/// Returns the longest accepted node of the first rule with an accepted node.
/// When no rule has one, the longest listing-page node across all rules is
/// returned flagged as `listing`.
#[must_use]
pub fn select_body(doc: &Html, rules: &[SelectorRule]) -> Option<BodyMatch> {
    let mut listing_fallback: Option<BodyMatch> = None;

    for rule in rules {
        let mut best: Option<String> = None;
        for element in doc.select(&rule.selector) {
            let text = element_text(element);
            match (rule.accept)(&text) {
                Verdict::Accept => {
                    if best.as_ref().map_or(true, |b| text.chars().count() > b.chars().count()) {
                        best = Some(text);
                    }
                }
                Verdict::Listing => {
                    if listing_fallback
                        .as_ref()
                        .map_or(true, |b| text.chars().count() > b.text.chars().count())
                    {
                        listing_fallback = Some(BodyMatch {
                            rule: rule.name,
                            text,
                            listing: true,
                        });
                    }
                }
                Verdict::Reject => {}
            }
        }
        if let Some(text) = best {
            return Some(BodyMatch {
                rule: rule.name,
                text,
                listing: false,
            });
        }
    }

    listing_fallback
}

/// Comment texts in document order, at most `limit`.
#[must_use]
pub fn select_comments(doc: &Html, limit: usize) -> Vec<String> {
    doc.select(&COMMENT_ITEM)
        .filter_map(|item| {
            let text = item
                .select(&COMMENT_TEXT)
                .map(element_text)
                .find(|t| !t.is_empty())
                .unwrap_or_else(|| element_text(item));
            (!text.is_empty()).then_some(text)
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Html {
        Html::parse_document(&format!("<html><body>{body}</body></html>"))
    }

    #[test]
    fn test_specific_rule_wins_over_generic() {
        let html = doc(r#"<div class="se-main-container"><p>본문 첫 줄</p><p>둘째 줄</p></div>
                         <main>훨씬 더 긴 텍스트가 들어있는 메인 영역입니다 그래도 밀림</main>"#);
        let found = select_body(&html, &BODY_RULES).unwrap();
        assert_eq!(found.rule, "smart-editor");
        assert_eq!(found.text, "본문 첫 줄\n둘째 줄");
        assert!(!found.listing);
    }

    #[test]
    fn test_longest_node_within_rule() {
        let html = doc(r#"<div class="se-main-container">짧음</div>
                         <div class="se-main-container">이쪽이 더 긴 본문</div>"#);
        assert_eq!(select_body(&html, &BODY_RULES).unwrap().text, "이쪽이 더 긴 본문");
    }

    #[test]
    fn test_join_wall_node_rejected_and_next_rule_used() {
        let html = doc(r#"<div class="se-main-container">카페에 가입하면 바로 글을 볼 수 있어요</div>
                         <article>실제 본문 내용</article>"#);
        let found = select_body(&html, &BODY_RULES).unwrap();
        assert_eq!(found.rule, "article");
    }

    #[test]
    fn test_wall_everywhere_yields_nothing() {
        let html = doc("카페에 가입하면 바로 글을 볼 수 있어요");
        assert!(select_body(&html, &BODY_RULES).is_none());
    }

    #[test]
    fn test_listing_only_is_flagged() {
        let html = doc("<main>전체글보기 게시글 목록 방문 수 3</main>");
        let found = select_body(&html, &BODY_RULES).unwrap();
        assert!(found.listing);
    }

    #[test]
    fn test_comments_bounded_and_ordered() {
        let html = doc(r#"<ul class="comment_list">
               <li class="CommentItem"><span class="nickname">a</span><span class="text_comment">첫 댓글</span></li>
               <li class="CommentItem"><span class="text_comment">둘째 댓글</span></li>
               <li class="CommentItem"><span class="text_comment">셋째 댓글</span></li>
            </ul>"#);
        assert_eq!(select_comments(&html, 2), vec!["첫 댓글", "둘째 댓글"]);
    }

    #[test]
    fn test_custom_rule_list() {
        fn only_long(text: &str) -> Verdict {
            if text.chars().count() > 5 {
                Verdict::Accept
            } else {
                Verdict::Reject
            }
        }
        let rules = vec![SelectorRule {
            name: "para",
            selector: Selector::parse("p").unwrap(),
            accept: only_long,
        }];
        let html = doc("<p>short</p><p>long enough</p>");
        assert_eq!(select_body(&html, &rules).unwrap().text, "long enough");
    }
}
