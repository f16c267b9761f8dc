//! Maximal repeated substring mining over the hashed program string.
//!
//! Implemented as a suffix array with an LCP-interval sweep: every internal
//! node of the (conceptual) suffix tree with at least two leaves below it
//! corresponds to one LCP interval, and each such interval of depth >= 2 is
//! reported as a repeated substring together with every position it occurs
//! at.

/// A substring of the program string occurring at two or more positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatedSubstring {
    /// Number of symbols in the substring
    pub length: usize,
    /// Every start position, ascending
    pub start_indices: Vec<usize>,
}

/// All maximal repeated substrings of `s` with length >= 2 occurring at
/// >= 2 positions.
pub fn repeated_substrings(s: &[u32]) -> Vec<RepeatedSubstring> {
    let n = s.len();
    if n < 4 {
        return vec![];
    }
    let sa = suffix_array(s);
    let lcp = lcp_array(s, &sa);

    let mut out = Vec::new();
    // Stack of open LCP intervals as (depth, left boundary).
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for i in 1..=n {
        let l = if i < n { lcp[i] } else { 0 };
        let mut left = i - 1;
        while let Some(&(top_depth, top_left)) = stack.last() {
            if top_depth <= l {
                break;
            }
            stack.pop();
            if top_depth >= 2 {
                let mut starts: Vec<usize> = sa[top_left..i].to_vec();
                starts.sort_unstable();
                out.push(RepeatedSubstring {
                    length: top_depth,
                    start_indices: starts,
                });
            }
            left = top_left;
        }
        if l > 0 && stack.last().map_or(true, |&(d, _)| d < l) {
            stack.push((l, left));
        }
    }
    out
}

/// Suffix array by prefix doubling.
fn suffix_array(s: &[u32]) -> Vec<usize> {
    let n = s.len();
    let mut sa: Vec<usize> = (0..n).collect();
    let mut rank: Vec<i64> = s.iter().map(|&x| x as i64).collect();
    let mut tmp: Vec<i64> = vec![0; n];
    let mut k = 1;
    loop {
        let key = |i: usize| (rank[i], if i + k < n { rank[i + k] } else { -1 });
        sa.sort_unstable_by_key(|&i| key(i));
        tmp[sa[0]] = 0;
        for j in 1..n {
            tmp[sa[j]] = tmp[sa[j - 1]] + i64::from(key(sa[j]) != key(sa[j - 1]));
        }
        rank.copy_from_slice(&tmp);
        if rank[sa[n - 1]] as usize == n - 1 {
            break;
        }
        k *= 2;
    }
    sa
}

/// Kasai's algorithm: `lcp[i]` is the longest common prefix of the
/// suffixes at `sa[i - 1]` and `sa[i]`.
fn lcp_array(s: &[u32], sa: &[usize]) -> Vec<usize> {
    let n = s.len();
    let mut rank = vec![0usize; n];
    for (i, &suffix) in sa.iter().enumerate() {
        rank[suffix] = i;
    }
    let mut lcp = vec![0usize; n];
    let mut h = 0usize;
    for i in 0..n {
        if rank[i] > 0 {
            let j = sa[rank[i] - 1];
            while i + h < n && j + h < n && s[i + h] == s[j + h] {
                h += 1;
            }
            lcp[rank[i]] = h;
            h = h.saturating_sub(1);
        } else {
            h = 0;
        }
    }
    lcp
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_finds_repeated_pair() {
        // "ababx" repeats "ab" at 0 and 2.
        let s = [1, 2, 1, 2, 9];
        let found = repeated_substrings(&s);
        assert!(found
            .iter()
            .any(|r| r.length == 2 && r.start_indices == vec![0, 2]));
    }

    #[test]
    fn test_finds_nested_repeats() {
        // "abcabc": "abc" twice; the sweep may also surface shorter
        // right-maximal repeats, but the length-3 one must be there.
        let s = [1, 2, 3, 1, 2, 3];
        let found = repeated_substrings(&s);
        assert!(found
            .iter()
            .any(|r| r.length == 3 && r.start_indices == vec![0, 3]));
    }

    #[test]
    fn test_no_repeats_in_unique_string() {
        let s = [1, 2, 3, 4, 5, 6];
        assert!(repeated_substrings(&s).is_empty());
    }

    #[test]
    fn test_three_occurrences_collected_together() {
        let s = [7, 8, 0, 7, 8, 1, 7, 8, 2];
        let found = repeated_substrings(&s);
        assert!(found
            .iter()
            .any(|r| r.length == 2 && r.start_indices == vec![0, 3, 6]));
    }

    proptest! {
        #[test]
        fn prop_every_report_really_repeats(s in proptest::collection::vec(0u32..5, 0..64)) {
            for rep in repeated_substrings(&s) {
                prop_assert!(rep.length >= 2);
                prop_assert!(rep.start_indices.len() >= 2);
                let first = &s[rep.start_indices[0]..rep.start_indices[0] + rep.length];
                for &start in &rep.start_indices[1..] {
                    prop_assert_eq!(&s[start..start + rep.length], first);
                }
            }
        }
    }
}
