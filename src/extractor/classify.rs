//! Text classifiers for pages that are not a readable post.
//!
//! All predicates compare against whitespace-free text so that line breaks
//! and spacing differences in the rendered page do not matter.

fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let text = compact(text);
    markers.iter().any(|marker| text.contains(&compact(marker)))
}

/// The cafe asks the visitor to join before reading.
const JOIN_WALL_MARKERS: &[&str] = &[
    "카페에 가입하면 바로 글을 볼 수 있어요",
    "카페 가입 후 이용",
    "카페 멤버만 볼 수 있",
    "멤버에게만 공개된 게시글",
    "가입하기 버튼을 눌러",
    "카페에 가입하시겠습니까",
];

/// The post is restricted to a higher membership tier.
const PERMISSION_WALL_MARKERS: &[&str] = &[
    "등급이 되시면 읽기가 가능한 게시판",
    "읽기 권한이 없습니다",
    "열람 권한이 없",
    "게시글을 볼 수 있는 권한이 없",
    "등급 이상 읽기 가능",
    "등업 후 이용",
];

/// The page is a member profile or a board listing.
const PROFILE_OR_LIST_MARKERS: &[&str] = &[
    "작성글 댓글단 글",
    "작성한 게시글",
    "카페 활동 내역",
    "방문 수",
    "전체글보기",
    "인기글 목록",
    "게시글 목록",
];

/// The article was deleted or never existed.
const MISSING_POST_MARKERS: &[&str] = &[
    "삭제되었거나 존재하지 않는 게시글",
    "존재하지 않는 게시글",
    "삭제된 게시글",
    "요청하신 페이지를 찾을 수 없습니다",
];

#[must_use]
pub fn is_join_wall(text: &str) -> bool {
    contains_any(text, JOIN_WALL_MARKERS)
}

#[must_use]
pub fn is_permission_wall(text: &str) -> bool {
    contains_any(text, PERMISSION_WALL_MARKERS)
}

/// Listing pages show several of these markers; a single hit is common in real posts.
#[must_use]
pub fn is_profile_or_list(text: &str) -> bool {
    let text = compact(text);
    PROFILE_OR_LIST_MARKERS
        .iter()
        .filter(|marker| text.contains(&compact(marker)))
        .count()
        >= 2
}

#[must_use]
pub fn is_missing_post(text: &str) -> bool {
    contains_any(text, MISSING_POST_MARKERS)
}

/// Either access wall.
#[must_use]
pub fn is_access_wall(text: &str) -> bool {
    is_join_wall(text) || is_permission_wall(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wall_detected_across_spacing() {
        assert!(is_join_wall("카페에 가입하면 바로 글을 볼 수 있어요"));
        assert!(is_join_wall("안내\n카페에 가입하면\n바로 글을 볼 수 있어요 가입하기"));
        assert!(!is_join_wall("오늘은 집중이 잘 되는 하루였다"));
    }

    #[test]
    fn test_permission_wall() {
        assert!(is_permission_wall("우수회원 등급이 되시면 읽기가 가능한 게시판 입니다."));
        assert!(!is_permission_wall("권한 설정 방법을 공유합니다"));
    }

    #[test]
    fn test_profile_or_list_needs_two_markers() {
        assert!(is_profile_or_list("닉네임 방문 수 12 작성글 댓글단 글"));
        assert!(!is_profile_or_list("전체글보기에서 찾았어요"));
    }

    #[test]
    fn test_missing_post() {
        assert!(is_missing_post("삭제되었거나 존재하지 않는 게시글입니다."));
        assert!(!is_missing_post("게시글 잘 봤습니다"));
    }

    #[test]
    fn test_access_wall_covers_both() {
        assert!(is_access_wall("열람 권한이 없습니다"));
        assert!(is_access_wall("카페 멤버만 볼 수 있는 글"));
        assert!(!is_access_wall("일반 본문"));
    }
}
