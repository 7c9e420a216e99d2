use scout_common::listing::Listing;

use crate::filters::UserFilter;

/// Collect every user whose filters accept `listing`. A user with several
/// matching filters appears once. Pure function of its inputs: given the
/// same listing and filter set it always returns the same users.
pub fn matching_users(listing: &Listing, filters: &[UserFilter]) -> Vec<i64> {
    let mut users: Vec<i64> = filters
        .iter()
        .filter(|filter| filter_matches(filter, listing))
        .map(|filter| filter.user_id)
        .collect();

    users.sort_unstable();
    users.dedup();
    users
}

/// Evaluate one filter as a conjunction of its set predicates. A constrained
/// predicate fails on listings that do not report the field at all: a price
/// cap makes no promise about a listing without a price.
pub fn filter_matches(filter: &UserFilter, listing: &Listing) -> bool {
    if let Some(min_price) = filter.min_price {
        match listing.price {
            Some(price) if price >= min_price => {}
            _ => return false,
        }
    }
    if let Some(max_price) = filter.max_price {
        match listing.price {
            Some(price) if price <= max_price => {}
            _ => return false,
        }
    }

    if let Some(rooms) = &filter.rooms {
        if !rooms.is_empty() {
            match listing.rooms {
                Some(listing_rooms) if rooms.contains(&listing_rooms) => {}
                _ => return false,
            }
        }
    }

    if let Some(cities) = &filter.cities {
        if !cities.is_empty() {
            let listing_city = match &listing.city {
                Some(city) => city.trim().to_lowercase(),
                None => return false,
            };
            if !cities.iter().any(|city| city.trim().to_lowercase() == listing_city) {
                return false;
            }
        }
    }

    if let Some(min_area) = filter.min_area_sqm {
        match listing.area_sqm {
            Some(area) if area >= min_area => {}
            _ => return false,
        }
    }

    true
}
