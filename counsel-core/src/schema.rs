use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    profiles (id) {
        id -> Uuid,
        role -> Text,
        name -> Text,
        email -> Nullable<Text>,
        city -> Nullable<Text>,
        photo_url -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

table! {
    lawyer_profiles (user_id) {
        user_id -> Uuid,
        specializations -> Array<Text>,
        price -> Nullable<Float8>,
        verified -> Bool,
        rating -> Float8,
        banner_url -> Nullable<Text>,
        verification_documents -> Array<Text>,
    }
}

table! {
    connection_requests (id) {
        id -> Uuid,
        sender_id -> Uuid,
        receiver_id -> Uuid,
        status -> Text,
        created_at -> Timestamptz,
    }
}

table! {
    chat_rooms (id) {
        id -> Uuid,
        participant_a -> Uuid,
        participant_b -> Uuid,
        last_message -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    chat_unread (chat_id, user_id) {
        chat_id -> Uuid,
        user_id -> Uuid,
        unread_count -> Integer,
    }
}

table! {
    chat_messages (id) {
        id -> Uuid,
        chat_id -> Uuid,
        sender_id -> Uuid,
        text -> Text,
        message_type -> Text,
        file_url -> Nullable<Text>,
        file_name -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

table! {
    cases (id) {
        id -> Uuid,
        lawyer_id -> Uuid,
        client_id -> Nullable<Uuid>,
        title -> Text,
        description -> Nullable<Text>,
        status -> Text,
        created_at -> Timestamptz,
    }
}

table! {
    time_entries (id) {
        id -> Uuid,
        case_id -> Uuid,
        lawyer_id -> Uuid,
        start_time -> Timestamptz,
        end_time -> Nullable<Timestamptz>,
        duration_minutes -> Nullable<BigInt>,
        rate_per_hour -> Nullable<Float8>,
        total_amount -> Nullable<Float8>,
    }
}

table! {
    case_documents (id) {
        id -> Uuid,
        case_id -> Uuid,
        lawyer_id -> Uuid,
        name -> Text,
        file_url -> Text,
        content_type -> Nullable<Text>,
        size_bytes -> Nullable<BigInt>,
        uploaded_at -> Timestamptz,
    }
}

table! {
    community_requests (id) {
        id -> Uuid,
        client_id -> Uuid,
        title -> Text,
        description -> Text,
        category -> Text,
        budget -> Nullable<Float8>,
        city -> Nullable<Text>,
        status -> Text,
        proposal_count -> Integer,
        created_at -> Timestamptz,
    }
}

table! {
    request_proposals (id) {
        id -> Uuid,
        request_id -> Uuid,
        lawyer_id -> Uuid,
        proposed_price -> Float8,
        message -> Text,
        estimated_duration -> Nullable<Text>,
        status -> Text,
        created_at -> Timestamptz,
    }
}

joinable!(lawyer_profiles -> profiles (user_id));
joinable!(chat_unread -> chat_rooms (chat_id));

allow_tables_to_appear_in_same_query!(
    profiles,
    lawyer_profiles,
    connection_requests,
    chat_rooms,
    chat_unread,
    chat_messages,
    cases,
    time_entries,
    case_documents,
    community_requests,
    request_proposals,
);
