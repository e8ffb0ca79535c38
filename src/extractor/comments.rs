//! Best-effort comment loading on a live page.
//!
//! Comments load lazily: the page must be scrolled, the comment panel may
//! need opening, and long threads hide behind "more" buttons. Every step
//! here is optional; failures are logged and the page is read as it is.

use std::time::Duration;

use tracing::debug;

use super::strategies::COMMENT_ITEM_CSS;
use crate::browser::PageDriver;

const SCROLL_STEP_PX: i64 = 1200;
const SCROLL_STEPS: usize = 4;
const SETTLE: Duration = Duration::from_millis(300);

const OPEN_COMMENTS: &str =
    ".ArticleTool .button_comment, a.button_comment, .comment_info a, a.btn_comment, .u_cbox_btn_view_comment";

const LOAD_MORE: &str =
    ".CommentBox .more_box .btn_more, .comment_more, button.button_more, .u_cbox_btn_more";

/// Scroll, open the comment panel if nothing is visible, and expand "more" controls.
///
/// Returns the number of expansions performed.
pub async fn load_comments(driver: &dyn PageDriver, max_expansions: usize, settle: bool) -> usize {
    let pause = || async move {
        if settle {
            tokio::time::sleep(SETTLE).await;
        }
    };

    for _ in 0..SCROLL_STEPS {
        if let Err(e) = driver.scroll_by(SCROLL_STEP_PX).await {
            debug!("Scroll failed: {e}");
            break;
        }
        pause().await;
    }

    match driver.count(COMMENT_ITEM_CSS).await {
        Ok(0) => match driver.click_first(OPEN_COMMENTS).await {
            Ok(true) => {
                debug!("Opened comment panel");
                pause().await;
            }
            Ok(false) => {}
            Err(e) => debug!("Opening comments failed: {e}"),
        },
        Ok(_) => {}
        Err(e) => debug!("Counting comments failed: {e}"),
    }

    let mut expansions = 0;
    while expansions < max_expansions {
        match driver.click_first(LOAD_MORE).await {
            Ok(true) => {
                expansions += 1;
                pause().await;
            }
            Ok(false) => break,
            Err(e) => {
                debug!("Expanding comments failed: {e}");
                break;
            }
        }
    }
    expansions
}
